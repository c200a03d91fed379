// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Engine
//!
//! One engine owns one subscription to one queue and turns broker deliveries
//! into handler invocations with the right acknowledgment. A delivery that
//! resolves no handler is rejected without requeue and the subscription keeps
//! going; a handler failure rejects the delivery (letting a configured
//! dead-letter policy take over) and surfaces the error on the engine's fault
//! channel. When the subscription dies abnormally, for example because the
//! queue was deleted underneath it, the engine recreates it and keeps
//! consuming; there is no retry ceiling on this path.

use crate::{
    config::DispatcherMode,
    dispatch::{HandlerBinding, HandlerKind, HandlerRegistry, OutboundReply},
    envelope::RawDelivery,
    errors::AmqpError,
    options::{ConsumerOptions, ExchangeType, MailboxOptions},
    otel, rpc,
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Delay between resubscribe attempts on the self-healing path.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

static MAILBOX_INDEX: AtomicU64 = AtomicU64::new(0);

/// Returns a process-unique consumer tag scoped by the application name.
pub(crate) fn next_consumer_tag(app_name: &str) -> String {
    let index = MAILBOX_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{app_name}({index})")
}

/// Subscription lifecycle, surfaced in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Subscribing,
    Active,
    ShuttingDown,
    Stopped,
}

struct EngineInner {
    channel: Arc<Channel>,
    options: MailboxOptions,
    consumer_options: ConsumerOptions,
    registry: Arc<HandlerRegistry>,
    consumer_tag: String,
}

/// Owns the subscription of one mailbox.
pub(crate) struct ConsumerEngine {
    inner: Arc<EngineInner>,
    mode: DispatcherMode,
}

/// Control surface of a running consumer: its tag, its fault stream, and stop.
pub struct ConsumerHandle {
    consumer_tag: String,
    stop: watch::Sender<bool>,
    faults: mpsc::UnboundedReceiver<AmqpError>,
    task: tokio::task::JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Receives the next handler failure. Handler errors never kill the
    /// subscription; they surface here.
    pub async fn next_fault(&mut self) -> Option<AmqpError> {
        self.faults.recv().await
    }

    /// Stops the subscription and waits for the engine task to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

impl ConsumerEngine {
    pub(crate) fn new(
        channel: Arc<Channel>,
        options: MailboxOptions,
        consumer_options: ConsumerOptions,
        registry: Arc<HandlerRegistry>,
        mode: DispatcherMode,
        consumer_tag: String,
    ) -> Self {
        ConsumerEngine {
            inner: Arc::new(EngineInner {
                channel,
                options,
                consumer_options,
                registry,
                consumer_tag,
            }),
            mode,
        }
    }

    /// Applies QoS, opens the subscription, and spawns the delivery loop.
    ///
    /// Failures here happen before anything runs and propagate to the caller.
    pub(crate) async fn start(self) -> Result<ConsumerHandle, AmqpError> {
        self.apply_qos().await?;

        let consumer = self.subscribe().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let consumer_tag = self.inner.consumer_tag.clone();

        let task = tokio::spawn(self.run(consumer, stop_rx, fault_tx));

        Ok(ConsumerHandle {
            consumer_tag,
            stop: stop_tx,
            faults: fault_rx,
            task,
        })
    }

    async fn apply_qos(&self) -> Result<(), AmqpError> {
        // rpc servers process strictly one request at a time per subscription
        let count = if self.inner.options.exchange_type == ExchangeType::RpcServer {
            1
        } else {
            self.inner.consumer_options.prefetch.count
        };

        match self
            .inner
            .channel
            .basic_qos(
                count,
                BasicQosOptions {
                    global: self.inner.consumer_options.prefetch.global,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn subscribe(&self) -> Result<lapin::Consumer, AmqpError> {
        debug!(
            state = ?ConsumerState::Subscribing,
            queue = self.inner.options.queue_name,
            consumer_tag = self.inner.consumer_tag,
            "creating consumer"
        );

        let mut session_args = std::collections::BTreeMap::new();
        for (key, value) in &self.inner.options.session_headers {
            session_args.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        match self
            .inner
            .channel
            .basic_consume(
                &self.inner.options.queue_name,
                &self.inner.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.inner.consumer_options.auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::from(session_args),
            )
            .await
        {
            Ok(consumer) => {
                debug!(
                    state = ?ConsumerState::Active,
                    consumer_tag = self.inner.consumer_tag,
                    "consumer registered"
                );
                Ok(consumer)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::CreateConsumerError(
                    self.inner.options.queue_name.clone(),
                ))
            }
        }
    }

    async fn run(
        self,
        mut consumer: lapin::Consumer,
        mut stop: watch::Receiver<bool>,
        faults: mpsc::UnboundedSender<AmqpError>,
    ) {
        loop {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => self.dispatch(delivery, &faults).await,
                        Some(Err(err)) => {
                            error!(error = err.to_string(), "errors consume msg");
                            break;
                        }
                        None => break,
                    },
                }
            }

            // a stop request, or a dropped handle, ends the engine normally
            if *stop.borrow() || self.handle_dropped(&stop) {
                debug!(
                    state = ?ConsumerState::Stopped,
                    consumer_tag = self.inner.consumer_tag,
                    "consumer shutdown"
                );
                return;
            }

            if !self.inner.channel.status().connected() {
                error!(
                    state = ?ConsumerState::Stopped,
                    consumer_tag = self.inner.consumer_tag,
                    "channel closed, consumer cannot recover"
                );
                return;
            }

            warn!(
                state = ?ConsumerState::ShuttingDown,
                consumer_tag = self.inner.consumer_tag,
                "consumer terminated abnormally, recreating subscription"
            );

            consumer = loop {
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;

                if *stop.borrow() {
                    return;
                }

                match self.subscribe().await {
                    Ok(consumer) => break consumer,
                    Err(err) => {
                        error!(error = err.to_string(), "resubscribe failed, retrying")
                    }
                }
            };
        }
    }

    fn handle_dropped(&self, stop: &watch::Receiver<bool>) -> bool {
        stop.has_changed().is_err()
    }

    async fn dispatch(&self, delivery: Delivery, faults: &mpsc::UnboundedSender<AmqpError>) {
        match self.mode {
            DispatcherMode::Sync => {
                process_delivery(self.inner.clone(), delivery, faults.clone()).await
            }
            DispatcherMode::Async => {
                tokio::spawn(process_delivery(
                    self.inner.clone(),
                    delivery,
                    faults.clone(),
                ));
            }
        }
    }
}

async fn process_delivery(
    inner: Arc<EngineInner>,
    delivery: Delivery,
    faults: mpsc::UnboundedSender<AmqpError>,
) {
    let msg_type = match delivery.properties.kind() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    };

    let tracer = global::tracer("amqp consumer");
    let (_ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &msg_type);

    debug!(
        "received: {} - exchange: {}",
        msg_type,
        delivery.exchange.to_string(),
    );

    let auto_ack = inner.consumer_options.auto_ack;

    let binding = if inner.options.exchange_type == ExchangeType::RpcServer {
        inner.registry.resolve(&msg_type, HandlerKind::Rpc)
    } else {
        inner.registry.resolve_consumer(&msg_type)
    };

    let binding = match binding {
        Ok(binding) => binding,
        Err(err) => {
            let msg = "removing message from queue - reason: unsupported msg type";
            warn!(error = err.to_string(), "{}", msg);
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(msg),
            });

            if !auto_ack {
                if let Err(e) = delivery.reject(BasicRejectOptions { requeue: false }).await {
                    error!("error whiling reject msg");
                    span.record_error(&e);
                }
            }

            return;
        }
    };

    let raw = RawDelivery::from_delivery(&delivery, &inner.consumer_tag);

    let outcome: Result<Option<OutboundReply>, AmqpError> = match &binding {
        HandlerBinding::Sync(invoke) => (**invoke)(raw).map(|_| None),
        HandlerBinding::Async(invoke) => (**invoke)(raw).await.map(|_| None),
        HandlerBinding::Rpc(invoke) => (**invoke)(raw).await,
    };

    match outcome {
        Ok(reply) => {
            if let Some(reply) = reply {
                if let Err(err) = rpc::send_reply(&inner.channel, &delivery, reply).await {
                    error!(error = err.to_string(), "error publishing rpc reply");
                    span.record_error(&err);
                    let _ = faults.send(err);
                }
            }

            debug!("message successfully processed");

            if !auto_ack {
                match delivery
                    .ack(BasicAckOptions {
                        multiple: inner.consumer_options.ack_multiple,
                    })
                    .await
                {
                    Err(e) => {
                        error!("error whiling ack msg");
                        span.record_error(&e);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                    }
                    _ => span.set_status(Status::Ok),
                }
            } else {
                span.set_status(Status::Ok);
            }
        }
        Err(err) => {
            error!(error = err.to_string(), "error consume msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            // with auto-ack the broker already considers the message consumed
            if !auto_ack {
                if let Err(e) = delivery.reject(BasicRejectOptions { requeue: false }).await {
                    error!("error whiling reject msg");
                    span.record_error(&e);
                }
            }

            let _ = faults.send(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_tags_are_scoped_and_unique() {
        let first = next_consumer_tag("billing");
        let second = next_consumer_tag("billing");

        assert!(first.starts_with("billing("));
        assert!(first.ends_with(')'));
        assert_ne!(first, second);
    }
}
