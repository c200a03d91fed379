// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The unit handed to application handlers: the decoded payload plus the
//! delivery coordinates (exchange, routing key, tags) and the raw message
//! metadata (type tag, correlation id, reply-to, headers).

use lapin::{message::Delivery, protocol::basic::AMQPProperties, types::FieldTable};

/// Metadata carried by a message's AMQP properties.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    /// Wire type tag identifying the logical payload type, empty when absent
    pub type_tag: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub headers: FieldTable,
}

impl MessageMeta {
    pub(crate) fn from_properties(props: &AMQPProperties) -> Self {
        let type_tag = match props.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        };

        let headers = match props.headers() {
            Some(value) => value.to_owned(),
            None => FieldTable::default(),
        };

        MessageMeta {
            type_tag,
            correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
            reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
            message_id: props.message_id().as_ref().map(|v| v.to_string()),
            headers,
        }
    }
}

/// A delivery before payload decoding.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub data: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub meta: MessageMeta,
}

impl RawDelivery {
    pub(crate) fn from_delivery(delivery: &Delivery, consumer_tag: &str) -> Self {
        RawDelivery {
            data: delivery.data.clone(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            meta: MessageMeta::from_properties(&delivery.properties),
        }
    }

    /// Pairs the decoded payload with this delivery's coordinates.
    pub(crate) fn into_envelope<T>(self, payload: T) -> Envelope<T> {
        Envelope {
            payload,
            exchange: self.exchange,
            routing_key: self.routing_key,
            consumer_tag: self.consumer_tag,
            delivery_tag: self.delivery_tag,
            redelivered: self.redelivered,
            meta: self.meta,
        }
    }
}

/// The unit delivered to handlers.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
    /// Per-channel monotonically increasing tag used to ack/reject this delivery
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub meta: MessageMeta,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn meta_extraction_reads_properties() {
        let props = AMQPProperties::default()
            .with_type(ShortString::from("orders.OrderCreated"))
            .with_correlation_id(ShortString::from("corr-1"))
            .with_reply_to(ShortString::from("amq.rabbitmq.reply-to"))
            .with_message_id(ShortString::from("msg-9"));

        let meta = MessageMeta::from_properties(&props);

        assert_eq!(meta.type_tag, "orders.OrderCreated");
        assert_eq!(meta.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(meta.reply_to.as_deref(), Some("amq.rabbitmq.reply-to"));
        assert_eq!(meta.message_id.as_deref(), Some("msg-9"));
    }

    #[test]
    fn meta_extraction_tolerates_bare_properties() {
        let meta = MessageMeta::from_properties(&AMQPProperties::default());

        assert_eq!(meta.type_tag, "");
        assert_eq!(meta.correlation_id, None);
        assert_eq!(meta.reply_to, None);
    }

    #[test]
    fn raw_delivery_becomes_envelope() {
        let raw = RawDelivery {
            data: b"{}".to_vec(),
            exchange: "direct".to_owned(),
            routing_key: "orders.created".to_owned(),
            consumer_tag: "app(1)".to_owned(),
            delivery_tag: 42,
            redelivered: true,
            meta: MessageMeta::default(),
        };

        let envelope = raw.into_envelope(7u32);

        assert_eq!(envelope.payload, 7);
        assert_eq!(envelope.delivery_tag, 42);
        assert!(envelope.redelivered);
        assert_eq!(envelope.routing_key, "orders.created");
    }
}
