// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! Publishing to RabbitMQ exchanges with full message properties: content
//! type, wire type tag, message id, correlation id, reply-to, priority,
//! expiration, delivery mode, and headers carrying the injected trace
//! context. Producer options are built per exchange kind; the RPC variants
//! assemble the correlated request/response shapes.

use crate::{
    codec::{encode_payload, Codec},
    dispatch::type_tag,
    errors::AmqpError,
    options::{DeliveryMode, RPC_REPLY_TO_QUEUE},
    otel,
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::error;
use uuid::Uuid;

/// Message properties attached to a publish.
#[derive(Debug, Clone, Default)]
pub struct ProducerProperties {
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    /// Correlation id linking an RPC request to its reply
    pub correlation_id: Option<String>,
    pub expiration: Option<Duration>,
    pub headers: BTreeMap<String, String>,
    pub delivery_mode: DeliveryMode,
}

/// Target and properties of a publish, built per exchange kind.
#[derive(Debug, Clone, Default)]
pub struct ProducerOptions {
    pub exchange_name: String,
    pub routing_key: String,
    pub properties: ProducerProperties,
}

impl ProducerOptions {
    /// Publish to a direct exchange with an exact routing key.
    pub fn direct(exchange_name: &str, routing_key: &str) -> Self {
        ProducerOptions {
            exchange_name: exchange_name.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: ProducerProperties::default(),
        }
    }

    /// Publish to a topic exchange with a dotted routing key.
    pub fn topic(exchange_name: &str, routing_key: &str) -> Self {
        Self::direct(exchange_name, routing_key)
    }

    /// Publish to a fanout exchange; the routing key is ignored by the broker.
    pub fn fanout(exchange_name: &str) -> Self {
        Self::direct(exchange_name, "")
    }

    /// Publish to a headers exchange; routing happens on the header values.
    pub fn headers(exchange_name: &str, headers: BTreeMap<String, String>) -> Self {
        let mut opts = Self::direct(exchange_name, "");
        opts.properties.headers = headers;
        opts
    }

    /// RPC request: default exchange, the server queue as routing key, the
    /// direct-reply pseudo-queue as reply target, non-persistent delivery.
    pub fn rpc_request(server_queue: &str, correlation_id: &str) -> Self {
        ProducerOptions {
            exchange_name: "".to_owned(),
            routing_key: server_queue.to_owned(),
            properties: ProducerProperties {
                reply_to: Some(RPC_REPLY_TO_QUEUE.to_owned()),
                correlation_id: Some(correlation_id.to_owned()),
                delivery_mode: DeliveryMode::NonPersistent,
                ..ProducerProperties::default()
            },
        }
    }

    /// RPC response: default exchange, the caller's reply-to as routing key,
    /// the request's correlation id copied over.
    pub fn rpc_response(reply_to: &str, correlation_id: &str) -> Self {
        ProducerOptions {
            exchange_name: "".to_owned(),
            routing_key: reply_to.to_owned(),
            properties: ProducerProperties {
                correlation_id: Some(correlation_id.to_owned()),
                delivery_mode: DeliveryMode::NonPersistent,
                ..ProducerProperties::default()
            },
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.properties.priority = Some(priority);
        self
    }

    pub fn expire_after(mut self, expiration: Duration) -> Self {
        self.properties.expiration = Some(expiration);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.properties
            .headers
            .insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Assembles the AMQP properties for a publish, injecting the trace context
/// into the header table.
pub(crate) fn assemble_properties(
    content_type: &str,
    opts: &ProducerOptions,
    type_tag: &str,
    ctx: &Context,
) -> BasicProperties {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    otel::inject_context(ctx, &mut btree);

    for (key, value) in &opts.properties.headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_type(ShortString::from(type_tag))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_delivery_mode(opts.properties.delivery_mode as u8)
        .with_headers(FieldTable::from(btree));

    if let Some(correlation_id) = &opts.properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
    }

    if let Some(reply_to) = &opts.properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }

    if let Some(priority) = opts.properties.priority {
        props = props.with_priority(priority);
    }

    if let Some(expiration) = opts.properties.expiration {
        props = props.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }

    props
}

/// Publisher bound to one channel.
pub struct Producer {
    channel: Arc<Channel>,
    codec: Arc<dyn Codec>,
}

impl Producer {
    pub fn new(channel: Arc<Channel>, codec: Arc<dyn Codec>) -> Arc<Producer> {
        Arc::new(Producer { channel, codec })
    }

    /// Serializes the payload and publishes it under its default type tag.
    pub async fn publish<T: Serialize>(
        &self,
        ctx: &Context,
        opts: &ProducerOptions,
        payload: &T,
    ) -> Result<(), AmqpError> {
        let body = encode_payload(self.codec.as_ref(), payload)?;
        self.publish_raw(ctx, opts, type_tag::<T>(), &body).await
    }

    /// Publishes pre-encoded bytes under an explicit type tag.
    pub async fn publish_raw(
        &self,
        ctx: &Context,
        opts: &ProducerOptions,
        type_tag: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let props = assemble_properties(self.codec.content_type(), opts, type_tag, ctx);

        match self
            .channel
            .basic_publish(
                &opts.exchange_name,
                &opts.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_request_targets_server_queue_with_direct_reply() {
        let opts = ProducerOptions::rpc_request("rpc.server", "corr-1");

        assert_eq!(opts.exchange_name, "");
        assert_eq!(opts.routing_key, "rpc.server");
        assert_eq!(opts.properties.reply_to.as_deref(), Some(RPC_REPLY_TO_QUEUE));
        assert_eq!(opts.properties.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(opts.properties.delivery_mode, DeliveryMode::NonPersistent);
    }

    #[test]
    fn rpc_response_routes_to_reply_address() {
        let opts = ProducerOptions::rpc_response("amq.rabbitmq.reply-to.g2d", "corr-1");

        assert_eq!(opts.exchange_name, "");
        assert_eq!(opts.routing_key, "amq.rabbitmq.reply-to.g2d");
        assert_eq!(opts.properties.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn assembled_properties_carry_tag_and_correlation() {
        let opts = ProducerOptions::rpc_request("rpc.server", "corr-7").priority(3);
        let props = assemble_properties("application/json", &opts, "demo.Request", &Context::new());

        match props.kind() {
            Some(kind) => assert_eq!(kind.to_string(), "demo.Request"),
            None => panic!("type tag missing"),
        }
        match props.correlation_id() {
            Some(id) => assert_eq!(id.to_string(), "corr-7"),
            None => panic!("correlation id missing"),
        }
        match props.reply_to() {
            Some(reply_to) => assert_eq!(reply_to.to_string(), RPC_REPLY_TO_QUEUE),
            None => panic!("reply-to missing"),
        }
        match props.priority() {
            Some(priority) => assert_eq!(*priority, 3),
            None => panic!("priority missing"),
        }
        match props.delivery_mode() {
            Some(mode) => assert_eq!(*mode, DeliveryMode::NonPersistent as u8),
            None => panic!("delivery mode missing"),
        }
        assert!(props.message_id().is_some());
    }

    #[test]
    fn expiration_is_stamped_in_milliseconds() {
        let opts = ProducerOptions::direct("direct", "k").expire_after(Duration::from_secs(2));
        let props = assemble_properties("application/json", &opts, "t", &Context::new());

        match props.expiration() {
            Some(expiration) => assert_eq!(expiration.to_string(), "2000"),
            None => panic!("expiration missing"),
        }
    }

    #[test]
    fn custom_headers_survive_assembly() {
        let opts = ProducerOptions::direct("direct", "k").header("tenant", "acme");
        let props = assemble_properties("application/json", &opts, "t", &Context::new());

        let headers = match props.headers() {
            Some(headers) => headers.to_owned(),
            None => panic!("headers missing"),
        };

        assert_eq!(
            headers.inner().get(&ShortString::from("tenant")),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
    }
}
