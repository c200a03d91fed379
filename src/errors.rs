// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy for the mailbox client. Construction-time
//! errors (configuration, resource conflicts) propagate to the caller; per-delivery
//! errors are isolated to the delivery that caused them. Broker failures are
//! classified by AMQP reply code so the resource lifecycle can tell an incompatible
//! redeclare apart from a missing or locked resource.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid mailbox descriptor or consumer options, raised at construction time
    #[error("invalid mailbox configuration: {0}")]
    Configuration(String),

    /// A resource exists with incompatible properties and auto-recreation is not enabled
    #[error("breaking change detected on resource `{0}`")]
    BreakingChangeDetected(String),

    /// A second incompatible redeclare occurred after one recovery attempt
    #[error("unable to recreate resource `{resource}`: {cause}")]
    UnableToRecreateResource { resource: String, cause: String },

    /// The type tag resolved to a registration but no binding of the requested kind exists
    #[error("no handler bound for type tag `{0}`")]
    HandlerNotFound(String),

    /// The type tag is unknown to the handler registry
    #[error("type tag `{0}` is not registered")]
    PayloadTypeUnresolvable(String),

    /// An RPC reply arrived but could not be decoded as the expected response type
    #[error("rpc reply did not match the expected response type `{0}`")]
    RpcCastMismatch(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindingError(String, String),

    /// Error deleting a resource
    #[error("failure to delete resource `{0}`")]
    DeleteResourceError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error creating a consumer on a queue
    #[error("failure to create consumer `{0}`")]
    CreateConsumerError(String),

    /// Error encoding a payload
    #[error("failure to serialize payload: {0}")]
    SerializeError(String),

    /// Error decoding a payload
    #[error("failure to deserialize payload: {0}")]
    DeserializeError(String),

    /// A handler reported a failure while processing a delivery
    #[error("handler failure: {0}")]
    HandlerError(String),
}

/// Classification of a broker-reported failure.
///
/// The resource lifecycle only recovers from `IncompatibleArguments`; the other
/// known classes are swallowed or surfaced depending on the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerFault {
    /// The resource exists with different properties than requested (406)
    IncompatibleArguments,
    /// Queue or exchange does not exist (404)
    NotFound,
    /// Exclusive resource owned by another connection (405)
    ResourceLocked,
    /// Anything the classifier does not recognize
    Unknown,
}

/// Classifies an AMQP reply code into a [`BrokerFault`].
pub(crate) fn classify_reply_code(code: u16) -> BrokerFault {
    match code {
        406 => BrokerFault::IncompatibleArguments,
        404 => BrokerFault::NotFound,
        405 => BrokerFault::ResourceLocked,
        _ => BrokerFault::Unknown,
    }
}

/// Classifies a lapin error into a [`BrokerFault`].
///
/// Only protocol-level errors carry a reply code; transport failures map to
/// `Unknown` and are handled by the connection layer.
pub(crate) fn classify_error(err: &lapin::Error) -> BrokerFault {
    match err {
        lapin::Error::ProtocolError(amqp) => classify_reply_code(amqp.get_id()),
        _ => BrokerFault::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_map_to_known_faults() {
        assert_eq!(classify_reply_code(406), BrokerFault::IncompatibleArguments);
        assert_eq!(classify_reply_code(404), BrokerFault::NotFound);
        assert_eq!(classify_reply_code(405), BrokerFault::ResourceLocked);
    }

    #[test]
    fn unrecognized_reply_codes_are_unknown() {
        assert_eq!(classify_reply_code(200), BrokerFault::Unknown);
        assert_eq!(classify_reply_code(541), BrokerFault::Unknown);
    }

    #[test]
    fn transport_errors_are_unknown() {
        assert_eq!(
            classify_error(&lapin::Error::ChannelsLimitReached),
            BrokerFault::Unknown
        );
    }
}
