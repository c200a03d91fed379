// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Correlation
//!
//! Request/response semantics on top of the publish/consume primitives. A
//! client holds one correlation id for its whole lifetime and receives replies
//! over the broker's direct-reply pseudo-queue; each expected response type
//! gets a single-slot handoff, created on first use and reused by later calls
//! of that type. The delivery path never blocks on a waiting caller: a reply
//! is pushed into its slot and the consumer moves on.
//!
//! A timeout or a cancellation yields `Ok(None)`, never an error; so does a
//! reply that cannot be decoded as the expected response type. Because the
//! correlation id is fixed, two concurrent calls expecting the same response
//! type are indistinguishable on the wire; the slot mutex serializes them
//! instead.

use crate::{
    codec::{decode_payload, encode_payload, Codec},
    dispatch::{type_tag, OutboundReply},
    envelope::MessageMeta,
    errors::AmqpError,
    options::{MailboxOptions, RPC_REPLY_TO_QUEUE},
    publisher::{assemble_properties, ProducerOptions},
};
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicPublishOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// A reply as handed from the delivery path to a waiting caller.
#[derive(Debug)]
pub(crate) struct ReplyPayload {
    pub(crate) type_tag: String,
    pub(crate) data: Vec<u8>,
}

/// Single-slot handoff for one expected response type.
struct CallSlot {
    tx: mpsc::Sender<ReplyPayload>,
    rx: Mutex<mpsc::Receiver<ReplyPayload>>,
}

impl CallSlot {
    fn new() -> Arc<CallSlot> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(CallSlot {
            tx,
            rx: Mutex::new(rx),
        })
    }
}

/// Pending calls of one client, keyed by expected response type tag.
#[derive(Default)]
pub(crate) struct PendingCalls {
    slots: DashMap<String, Arc<CallSlot>>,
}

impl PendingCalls {
    /// Returns the slot for a response tag, creating it on first use.
    fn slot(&self, response_tag: &str) -> Arc<CallSlot> {
        self.slots
            .entry(response_tag.to_owned())
            .or_insert_with(CallSlot::new)
            .value()
            .clone()
    }

    /// Hands a reply to the caller waiting on its type, without blocking.
    ///
    /// Returns false when nobody ever awaited this type or the slot already
    /// holds an unconsumed value.
    fn deliver(&self, reply: ReplyPayload) -> bool {
        match self.slots.get(&reply.type_tag) {
            Some(slot) => slot.tx.try_send(reply).is_ok(),
            None => false,
        }
    }
}

/// Waits on a slot receiver, racing the reply against timeout and cancellation.
async fn await_reply<C>(
    rx: &mut mpsc::Receiver<ReplyPayload>,
    timeout: Duration,
    cancel: C,
) -> Option<ReplyPayload>
where
    C: Future<Output = ()>,
{
    tokio::pin!(cancel);

    tokio::select! {
        reply = rx.recv() => reply,
        _ = tokio::time::sleep(timeout) => {
            debug!("rpc call timed out");
            None
        }
        _ = &mut cancel => {
            debug!("rpc call cancelled");
            None
        }
    }
}

/// Decodes a reply as the expected response type.
///
/// A reply of another shape is a cast mismatch, reported as "no usable
/// response" rather than an error.
fn decode_reply<Resp: DeserializeOwned>(
    codec: &dyn Codec,
    reply: ReplyPayload,
) -> Result<Option<Resp>, AmqpError> {
    match decode_payload::<Resp>(codec, &reply.data) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            let mismatch = AmqpError::RpcCastMismatch(type_tag::<Resp>().to_owned());
            warn!(
                error = err.to_string(),
                reply_tag = reply.type_tag,
                "{}",
                mismatch
            );
            Ok(None)
        }
    }
}

/// RPC client bound to one server queue.
pub struct RpcClient {
    options: MailboxOptions,
    channel: Arc<Channel>,
    codec: Arc<dyn Codec>,
    calls: Arc<PendingCalls>,
    call_timeout: Duration,
    consumer_tag: String,
    reply_task: tokio::task::JoinHandle<()>,
}

impl RpcClient {
    /// Subscribes to the direct-reply pseudo-queue and returns a ready client.
    ///
    /// The subscription must exist before the first publish, otherwise the
    /// broker rejects the request's reply-to address.
    pub(crate) async fn start(
        channel: Arc<Channel>,
        codec: Arc<dyn Codec>,
        options: MailboxOptions,
        call_timeout: Duration,
        consumer_tag: String,
    ) -> Result<RpcClient, AmqpError> {
        let consumer = match channel
            .basic_consume(
                RPC_REPLY_TO_QUEUE,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    // the direct-reply mechanism requires auto-ack
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the reply consumer");
                return Err(AmqpError::CreateConsumerError(RPC_REPLY_TO_QUEUE.to_owned()));
            }
        };

        let calls = Arc::new(PendingCalls::default());
        let correlation_id = options.correlation_id.clone().unwrap_or_default();

        let reply_task = tokio::spawn(reply_loop(consumer, calls.clone(), correlation_id));

        Ok(RpcClient {
            options,
            channel,
            codec,
            calls,
            call_timeout,
            consumer_tag,
            reply_task,
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn correlation_id(&self) -> &str {
        self.options.correlation_id.as_deref().unwrap_or_default()
    }

    /// Calls the server with the client's default timeout and no cancellation.
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Option<Resp>, AmqpError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_with(request, self.call_timeout, futures_util::future::pending())
            .await
    }

    /// Publishes a correlated request and waits for a reply of type `Resp`.
    ///
    /// Returns `Ok(None)` when the timeout elapses, the cancellation future
    /// completes, or the reply does not decode as `Resp`. Only local faults
    /// (serialization, channel unavailable) produce an error.
    pub async fn call_with<Req, Resp, C>(
        &self,
        request: &Req,
        timeout: Duration,
        cancel: C,
    ) -> Result<Option<Resp>, AmqpError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        C: Future<Output = ()>,
    {
        let response_tag = type_tag::<Resp>();
        let slot = self.calls.slot(response_tag);

        // holding the receiver serializes same-typed calls from this client
        let mut rx = slot.rx.lock().await;

        while let Ok(stale) = rx.try_recv() {
            debug!(reply_tag = stale.type_tag, "discarding stale rpc reply");
        }

        let body = encode_payload(self.codec.as_ref(), request)?;
        let opts = ProducerOptions::rpc_request(&self.options.routing_key, self.correlation_id());
        let props = assemble_properties(
            self.codec.content_type(),
            &opts,
            type_tag::<Req>(),
            &Context::current(),
        );

        if let Err(err) = self
            .channel
            .basic_publish(
                &opts.exchange_name,
                &opts.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                props,
            )
            .await
        {
            error!(error = err.to_string(), "error publishing rpc request");
            return Err(AmqpError::PublishingError);
        }

        match await_reply(&mut rx, timeout, cancel).await {
            Some(reply) => decode_reply::<Resp>(self.codec.as_ref(), reply),
            None => Ok(None),
        }
    }

    /// Tears down the reply subscription. In-flight server work is unaffected.
    pub async fn close(self) {
        self.reply_task.abort();
        let _ = self.reply_task.await;
    }
}

async fn reply_loop(
    mut consumer: lapin::Consumer,
    calls: Arc<PendingCalls>,
    correlation_id: String,
) {
    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                let meta = MessageMeta::from_properties(&delivery.properties);

                if let Some(correlation) = &meta.correlation_id {
                    if correlation != &correlation_id {
                        warn!(
                            correlation_id = correlation,
                            "reply carried a foreign correlation id, dropping"
                        );
                        continue;
                    }
                }

                let reply_tag = meta.type_tag.clone();
                let accepted = calls.deliver(ReplyPayload {
                    type_tag: meta.type_tag,
                    data: delivery.data,
                });

                if !accepted {
                    debug!(reply_tag, "no caller waiting for this reply type, dropping");
                }
            }
            Err(err) => error!(error = err.to_string(), "errors consume rpc reply"),
        }
    }
}

/// Publishes an RPC server handler's response back to the caller.
///
/// The reply goes to the default exchange with the request's reply-to as the
/// routing key, the request's correlation id copied over, and the response's
/// type tag. A request without a reply-to address gets no reply.
pub(crate) async fn send_reply(
    channel: &Channel,
    request: &Delivery,
    reply: OutboundReply,
) -> Result<(), AmqpError> {
    let reply_to = match request.properties.reply_to() {
        Some(value) => value.to_string(),
        _ => {
            warn!("rpc request carried no reply-to address, dropping reply");
            return Ok(());
        }
    };

    let mut props =
        BasicProperties::default().with_type(ShortString::from(reply.type_tag.clone()));

    if let Some(correlation_id) = request.properties.correlation_id() {
        props = props.with_correlation_id(correlation_id.clone());
    }

    match channel
        .basic_publish(
            "",
            &reply_to,
            BasicPublishOptions::default(),
            &reply.body,
            props,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error publishing rpc reply");
            Err(AmqpError::PublishingError)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Increment {
        value: u32,
    }

    fn reply(tag: &str, data: &[u8]) -> ReplyPayload {
        ReplyPayload {
            type_tag: tag.to_owned(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn slots_are_created_lazily_and_reused() {
        let calls = PendingCalls::default();

        let first = calls.slot("demo.Response");
        let second = calls.slot("demo.Response");
        let other = calls.slot("demo.Other");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn delivery_without_a_waiting_slot_is_dropped() {
        let calls = PendingCalls::default();
        assert!(!calls.deliver(reply("demo.Response", b"{}")));
    }

    #[test]
    fn slot_accepts_at_most_one_value() {
        let calls = PendingCalls::default();
        let _slot = calls.slot("demo.Response");

        assert!(calls.deliver(reply("demo.Response", b"{}")));
        assert!(!calls.deliver(reply("demo.Response", b"{}")));
    }

    #[tokio::test]
    async fn delivered_reply_reaches_the_waiting_caller() {
        let calls = PendingCalls::default();
        let slot = calls.slot("demo.Response");

        assert!(calls.deliver(reply("demo.Response", b"{\"value\":1}")));

        let mut rx = slot.rx.lock().await;
        let received = await_reply(
            &mut rx,
            Duration::from_secs(1),
            futures_util::future::pending(),
        )
        .await
        .expect("reply was delivered");

        assert_eq!(received.data, b"{\"value\":1}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_no_reply() {
        let calls = PendingCalls::default();
        let slot = calls.slot("demo.Response");

        let mut rx = slot.rx.lock().await;
        let received = await_reply(
            &mut rx,
            Duration::from_secs(5),
            futures_util::future::pending(),
        )
        .await;

        assert!(received.is_none());
    }

    #[tokio::test]
    async fn cancellation_yields_no_reply() {
        let calls = PendingCalls::default();
        let slot = calls.slot("demo.Response");

        let mut rx = slot.rx.lock().await;
        let received = await_reply(
            &mut rx,
            Duration::from_secs(60),
            futures_util::future::ready(()),
        )
        .await;

        assert!(received.is_none());
    }

    #[test]
    fn mismatched_reply_is_no_usable_response() {
        let codec = JsonCodec;

        let outcome =
            decode_reply::<Increment>(&codec, reply("demo.Other", b"{\"text\":\"hi\"}")).unwrap();

        assert_eq!(outcome, None);
    }

    #[test]
    fn matching_reply_decodes() {
        let codec = JsonCodec;

        let outcome =
            decode_reply::<Increment>(&codec, reply("demo.Increment", b"{\"value\":2}")).unwrap();

        assert_eq!(outcome, Some(Increment { value: 2 }));
    }

    #[tokio::test]
    async fn stale_reply_is_drained_before_the_next_call() {
        let calls = PendingCalls::default();
        let slot = calls.slot("demo.Response");

        // an earlier call timed out and its reply arrived late
        assert!(calls.deliver(reply("demo.Response", b"{\"value\":1}")));

        let mut rx = slot.rx.lock().await;
        while let Ok(stale) = rx.try_recv() {
            assert_eq!(stale.data, b"{\"value\":1}");
        }

        // the next call must start from an empty slot
        let received = await_reply(
            &mut rx,
            Duration::from_millis(10),
            futures_util::future::pending(),
        )
        .await;
        assert!(received.is_none());
    }
}
