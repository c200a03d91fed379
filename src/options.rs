// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Mailbox and Consumer Options
//!
//! This module defines the immutable mailbox descriptor ([`MailboxOptions`]) and
//! the consumer configuration bag ([`ConsumerOptions`]). A descriptor is built
//! once per mailbox through the kind-specific constructors, which validate their
//! inputs; it never mutates afterwards. Consumer options use the builder pattern
//! and carry the two independent recreate flag sets consumed by the resource
//! lifecycle.

use crate::errors::AmqpError;
use bitflags::bitflags;
use std::{collections::BTreeMap, time::Duration};
use uuid::Uuid;

/// Pseudo-queue provided by the broker's direct-reply mechanism. RPC clients
/// consume from it without declaring anything.
pub const RPC_REPLY_TO_QUEUE: &str = "amq.rabbitmq.reply-to";

/// Default queue name for RPC servers when the caller does not pass one.
pub const RPC_DEFAULT_QUEUE: &str = "rpc.server";

/// Header key selecting the match semantics of a headers exchange binding.
pub const X_MATCH_HEADER: &str = "x-match";

/// Represents the kinds of mailbox targets.
///
/// The first four map to broker exchange types; the RPC kinds are client-side
/// flavors that reuse the default exchange and the direct-reply mechanism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
    RpcClient,
    RpcServer,
}

impl ExchangeType {
    /// Default exchange name for this kind when the descriptor does not name one.
    pub fn default_exchange_name(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
            // RPC flavors publish through the default exchange
            ExchangeType::RpcClient | ExchangeType::RpcServer => "",
        }
    }

    /// The lapin exchange kind to declare, or `None` for the RPC pseudo kinds.
    pub(crate) fn declarable_kind(&self) -> Option<lapin::ExchangeKind> {
        match self {
            ExchangeType::Direct => Some(lapin::ExchangeKind::Direct),
            ExchangeType::Topic => Some(lapin::ExchangeKind::Topic),
            ExchangeType::Fanout => Some(lapin::ExchangeKind::Fanout),
            ExchangeType::Headers => Some(lapin::ExchangeKind::Headers),
            ExchangeType::RpcClient | ExchangeType::RpcServer => None,
        }
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self, ExchangeType::RpcClient | ExchangeType::RpcServer)
    }
}

/// Headers exchange match kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XMatch {
    /// Must match all headers
    All,
    /// Must match any of the headers
    Any,
}

impl XMatch {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            XMatch::All => "all",
            XMatch::Any => "any",
        }
    }
}

/// Queue storage mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueMode {
    #[default]
    Default,
    /// Messages kept on disk, loaded into memory on demand
    Lazy,
    /// Replicated quorum queue
    Quorum,
}

/// Message delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    NonPersistent = 1,
    #[default]
    Persistent = 2,
}

bitflags! {
    /// Recreate behavior for a broker resource, combinable as flags.
    ///
    /// Any flag other than `RECREATE_IF_BREAKING_CHANGE_DETECTED` forces a
    /// delete before the declare; the unused/empty flags parameterize how the
    /// delete is issued.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecreateMode: u8 {
        const NONE = 0;
        /// Delete only when the resource has no consumers/bindings
        const RECREATE_IF_UNUSED = 1 << 0;
        /// Delete only when the queue is empty
        const RECREATE_IF_EMPTY = 1 << 1;
        /// Delete unconditionally
        const FORCE_RECREATE = 1 << 2;
        /// Recover automatically when an incompatible redeclare is detected
        const RECREATE_IF_BREAKING_CHANGE_DETECTED = 1 << 3;
    }
}

impl RecreateMode {
    /// Whether the resource must be deleted before the initial declare.
    pub(crate) fn forces_predelete(&self) -> bool {
        self.intersects(
            RecreateMode::RECREATE_IF_UNUSED
                | RecreateMode::RECREATE_IF_EMPTY
                | RecreateMode::FORCE_RECREATE,
        )
    }

    /// Delete parameters (`if_unused`, `if_empty`) derived from the flags.
    pub(crate) fn delete_semantics(&self) -> (bool, bool) {
        (
            self.contains(RecreateMode::RECREATE_IF_UNUSED),
            self.contains(RecreateMode::RECREATE_IF_EMPTY),
        )
    }

    pub(crate) fn recreates_on_breaking_change(&self) -> bool {
        self.contains(RecreateMode::RECREATE_IF_BREAKING_CHANGE_DETECTED)
    }
}

/// Immutable descriptor of a mailbox target resource.
///
/// Identity is the field tuple; instances never mutate after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxOptions {
    pub exchange_name: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub queue_name: String,
    /// Client-generated correlation id, RPC client mailboxes only
    pub correlation_id: Option<String>,
    /// Arguments added to the queue binding (headers exchanges)
    pub queue_binding_headers: BTreeMap<String, String>,
    /// Free-form headers attached to every message of this session
    pub session_headers: BTreeMap<String, String>,
}

impl MailboxOptions {
    /// Direct mailbox: exact routing-key match.
    pub fn direct(routing_key: &str, queue_name: &str) -> Result<Self, AmqpError> {
        if routing_key.is_empty() {
            return Err(AmqpError::Configuration(
                "unable to create a direct mailbox with an empty routing key".to_owned(),
            ));
        }

        Self::named(ExchangeType::Direct, routing_key, queue_name)
    }

    /// Topic mailbox: wildcard pattern routing.
    pub fn topic(routing_key: &str, queue_name: &str) -> Result<Self, AmqpError> {
        if routing_key.is_empty() {
            return Err(AmqpError::Configuration(
                "unable to create a topic mailbox with an empty routing key".to_owned(),
            ));
        }

        Self::named(ExchangeType::Topic, routing_key, queue_name)
    }

    /// Fanout mailbox: broadcast, no routing key.
    pub fn fanout(queue_name: &str) -> Result<Self, AmqpError> {
        Self::named(ExchangeType::Fanout, "", queue_name)
    }

    /// Headers mailbox: routed on header values with all/any match semantics.
    pub fn headers(
        headers: BTreeMap<String, String>,
        x_match: XMatch,
        queue_name: &str,
    ) -> Result<Self, AmqpError> {
        let mut opts = Self::named(ExchangeType::Headers, "", queue_name)?;

        opts.queue_binding_headers
            .insert(X_MATCH_HEADER.to_owned(), x_match.as_str().to_owned());
        opts.queue_binding_headers.extend(headers);

        Ok(opts)
    }

    /// RPC server mailbox: exclusive queue on the default exchange.
    pub fn rpc_server(queue_name: Option<&str>) -> Result<Self, AmqpError> {
        let queue = queue_name.unwrap_or(RPC_DEFAULT_QUEUE);
        if queue.is_empty() {
            return Err(AmqpError::Configuration(
                "unable to create an rpc server with an empty queue name".to_owned(),
            ));
        }

        Ok(MailboxOptions {
            exchange_name: "".to_owned(),
            exchange_type: ExchangeType::RpcServer,
            routing_key: queue.to_owned(),
            queue_name: queue.to_owned(),
            correlation_id: None,
            queue_binding_headers: BTreeMap::new(),
            session_headers: BTreeMap::new(),
        })
    }

    /// RPC client mailbox: no real queue, a fresh correlation id, and the
    /// broker's direct-reply pseudo-queue as the reply target.
    pub fn rpc_client(server_queue_name: Option<&str>) -> Result<Self, AmqpError> {
        let server_queue = server_queue_name.unwrap_or(RPC_DEFAULT_QUEUE);
        if server_queue.is_empty() {
            return Err(AmqpError::Configuration(
                "unable to create an rpc client with an empty server queue name".to_owned(),
            ));
        }

        Ok(MailboxOptions {
            exchange_name: "".to_owned(),
            exchange_type: ExchangeType::RpcClient,
            routing_key: server_queue.to_owned(),
            queue_name: RPC_REPLY_TO_QUEUE.to_owned(),
            correlation_id: Some(Uuid::new_v4().to_string()),
            queue_binding_headers: BTreeMap::new(),
            session_headers: BTreeMap::new(),
        })
    }

    /// Overrides the default exchange name. Only meaningful for non-RPC kinds.
    pub fn with_exchange_name(mut self, exchange_name: &str) -> Self {
        self.exchange_name = exchange_name.to_owned();
        self
    }

    /// Attaches session headers carried by every message of this mailbox.
    pub fn with_session_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.session_headers = headers;
        self
    }

    fn named(
        exchange_type: ExchangeType,
        routing_key: &str,
        queue_name: &str,
    ) -> Result<Self, AmqpError> {
        if queue_name.is_empty() {
            return Err(AmqpError::Configuration(format!(
                "unable to create a {exchange_type:?} mailbox with an empty queue name"
            )));
        }

        Ok(MailboxOptions {
            exchange_name: exchange_type.default_exchange_name().to_owned(),
            exchange_type,
            routing_key: routing_key.to_owned(),
            queue_name: queue_name.to_owned(),
            correlation_id: None,
            queue_binding_headers: BTreeMap::new(),
            session_headers: BTreeMap::new(),
        })
    }
}

/// Prefetch settings applied before a consumer becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchOptions {
    /// Number of unacknowledged deliveries the broker keeps in flight.
    /// Zero means no limit.
    pub count: u16,
    /// Whether the prefetch count applies per channel instead of per consumer
    pub global: bool,
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        PrefetchOptions {
            count: 0,
            global: false,
        }
    }
}

impl PrefetchOptions {
    /// Prefetch size in bytes. Brokers reject a nonzero value with
    /// `NOT_IMPLEMENTED - prefetch_size!=0`, so it is fixed at zero.
    pub const fn size(&self) -> u32 {
        0
    }
}

/// Consumer configuration bag.
///
/// Created once at mailbox construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    /// Broker considers a delivery consumed as soon as it is sent
    pub auto_ack: bool,
    /// Acknowledge all deliveries up to and including the tag
    pub ack_multiple: bool,
    /// Exchange persists across broker restarts.
    /// Changing this on an existing exchange is a breaking change.
    pub exchange_durable: bool,
    pub exchange_auto_delete: bool,
    pub queue_durable: bool,
    pub queue_exclusive: bool,
    pub queue_auto_delete: bool,
    /// Maximum number of messages the queue holds
    pub queue_size_limit: Option<i32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub queue_max_priority: Option<u8>,
    pub queue_mode: QueueMode,
    pub prefetch: PrefetchOptions,
    /// Timeout applied to RPC calls issued through this mailbox
    pub rpc_call_timeout: Duration,
    pub exchange_recreate_mode: RecreateMode,
    pub queue_recreate_mode: RecreateMode,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            auto_ack: false,
            ack_multiple: false,
            exchange_durable: false,
            exchange_auto_delete: false,
            queue_durable: false,
            queue_exclusive: false,
            queue_auto_delete: false,
            queue_size_limit: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            queue_max_priority: None,
            queue_mode: QueueMode::Default,
            prefetch: PrefetchOptions::default(),
            rpc_call_timeout: Duration::from_secs(5),
            exchange_recreate_mode: RecreateMode::NONE,
            queue_recreate_mode: RecreateMode::NONE,
        }
    }
}

impl ConsumerOptions {
    pub fn new() -> Self {
        ConsumerOptions::default()
    }

    /// Defaults for an RPC server consumer: transient exclusive auto-deleting
    /// queue, broker-acked deliveries.
    pub fn rpc_server() -> Self {
        ConsumerOptions {
            auto_ack: true,
            queue_auto_delete: true,
            ..ConsumerOptions::default()
        }
    }

    /// Defaults for an RPC client: replies on the direct-reply pseudo-queue
    /// must be consumed with auto-ack.
    pub fn rpc_client() -> Self {
        ConsumerOptions {
            auto_ack: true,
            ..ConsumerOptions::default()
        }
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn ack_multiple(mut self) -> Self {
        self.ack_multiple = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.queue_durable = true;
        self
    }

    pub fn durable_exchange(mut self) -> Self {
        self.exchange_durable = true;
        self
    }

    pub fn auto_delete_exchange(mut self) -> Self {
        self.exchange_auto_delete = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.queue_exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.queue_auto_delete = true;
        self
    }

    pub fn size_limit(mut self, limit: i32) -> Self {
        self.queue_size_limit = Some(limit);
        self
    }

    /// Routes rejected and expired messages to the given dead-letter target.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn max_priority(mut self, priority: u8) -> Self {
        self.queue_max_priority = Some(priority);
        self
    }

    pub fn lazy(mut self) -> Self {
        self.queue_mode = QueueMode::Lazy;
        self
    }

    pub fn quorum(mut self) -> Self {
        self.queue_mode = QueueMode::Quorum;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch.count = count;
        self
    }

    pub fn prefetch_global(mut self) -> Self {
        self.prefetch.global = true;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_call_timeout = timeout;
        self
    }

    pub fn recreate_exchange(mut self, mode: RecreateMode) -> Self {
        self.exchange_recreate_mode = mode;
        self
    }

    pub fn recreate_queue(mut self, mode: RecreateMode) -> Self {
        self.queue_recreate_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_requires_routing_key_and_queue() {
        assert!(matches!(
            MailboxOptions::direct("", "inbox"),
            Err(AmqpError::Configuration(_))
        ));
        assert!(matches!(
            MailboxOptions::direct("orders.created", ""),
            Err(AmqpError::Configuration(_))
        ));

        let opts = MailboxOptions::direct("orders.created", "inbox").unwrap();
        assert_eq!(opts.exchange_name, "direct");
        assert_eq!(opts.correlation_id, None);
    }

    #[test]
    fn headers_mailbox_carries_x_match_binding() {
        let mut headers = BTreeMap::new();
        headers.insert("format".to_owned(), "excel".to_owned());

        let opts = MailboxOptions::headers(headers, XMatch::Any, "reports").unwrap();

        assert_eq!(
            opts.queue_binding_headers.get(X_MATCH_HEADER),
            Some(&"any".to_owned())
        );
        assert_eq!(
            opts.queue_binding_headers.get("format"),
            Some(&"excel".to_owned())
        );
    }

    #[test]
    fn rpc_client_gets_correlation_id_and_pseudo_queue() {
        let opts = MailboxOptions::rpc_client(None).unwrap();

        assert_eq!(opts.queue_name, RPC_REPLY_TO_QUEUE);
        assert_eq!(opts.routing_key, RPC_DEFAULT_QUEUE);
        assert!(opts.correlation_id.is_some());

        let other = MailboxOptions::rpc_client(None).unwrap();
        assert_ne!(opts.correlation_id, other.correlation_id);
    }

    #[test]
    fn rpc_server_routes_through_its_queue_name() {
        let opts = MailboxOptions::rpc_server(Some("calc")).unwrap();
        assert_eq!(opts.exchange_name, "");
        assert_eq!(opts.routing_key, "calc");
        assert_eq!(opts.queue_name, "calc");
    }

    #[test]
    fn recreate_mode_predelete_derivation() {
        assert!(!RecreateMode::NONE.forces_predelete());
        assert!(!RecreateMode::RECREATE_IF_BREAKING_CHANGE_DETECTED.forces_predelete());
        assert!(RecreateMode::FORCE_RECREATE.forces_predelete());
        assert!(RecreateMode::RECREATE_IF_UNUSED.forces_predelete());

        let combined =
            RecreateMode::RECREATE_IF_UNUSED | RecreateMode::RECREATE_IF_BREAKING_CHANGE_DETECTED;
        assert!(combined.forces_predelete());
        assert_eq!(combined.delete_semantics(), (true, false));
        assert!(combined.recreates_on_breaking_change());
    }

    #[test]
    fn delete_semantics_follow_flags() {
        assert_eq!(
            RecreateMode::RECREATE_IF_EMPTY.delete_semantics(),
            (false, true)
        );
        assert_eq!(RecreateMode::FORCE_RECREATE.delete_semantics(), (false, false));
    }

    #[test]
    fn prefetch_size_is_always_zero() {
        let prefetch = PrefetchOptions {
            count: 50,
            global: true,
        };
        assert_eq!(prefetch.size(), 0);
    }
}
