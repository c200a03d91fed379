// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Lifecycle Management
//!
//! This module brings an exchange and a queue into the state described by a
//! mailbox descriptor and its consumer options, handling pre-existing and
//! possibly incompatible resources. An incompatible redeclare either aborts
//! with `BreakingChangeDetected` or, when the caller opted in, is recovered
//! once by deleting and redeclaring; a second conflict after recovery is
//! fatal.
//!
//! Per resource the lifecycle is:
//! `Initial -> Declared`, or
//! `Initial -> ConflictDetected -> Recovering -> Declared`, or
//! `... -> Fatal` on the second conflict.

use crate::{
    errors::{classify_error, AmqpError, BrokerFault},
    options::{ConsumerOptions, ExchangeType, MailboxOptions, QueueMode, RecreateMode},
};
use lapin::{
    options::{
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum message priority
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the header field selecting the lazy queue mode
pub const AMQP_HEADERS_QUEUE_MODE: &str = "x-queue-mode";
/// Constant for the header field selecting the quorum queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";

/// Mutable conflict state of one resource instance.
///
/// The flag only ever moves forward: unset until the first incompatible
/// redeclare, set afterwards. A conflict observed while the flag is already
/// set means the recovery attempt failed.
#[derive(Debug, Default)]
pub(crate) struct ResourceState {
    breaking_change_detected: bool,
}

/// Decides how to react to an incompatible-arguments failure.
///
/// Returns the delete semantics (`if_unused`, `if_empty`) for the single
/// permitted recovery attempt, or the error to surface. The conflict is
/// recorded before the opt-in check so a later conflict on the same instance
/// is always fatal.
pub(crate) fn plan_recovery(
    mode: RecreateMode,
    state: &mut ResourceState,
    resource: &str,
    cause: &str,
) -> Result<(bool, bool), AmqpError> {
    if state.breaking_change_detected {
        return Err(AmqpError::UnableToRecreateResource {
            resource: resource.to_owned(),
            cause: cause.to_owned(),
        });
    }

    state.breaking_change_detected = true;

    if !mode.recreates_on_breaking_change() {
        return Err(AmqpError::BreakingChangeDetected(resource.to_owned()));
    }

    Ok(mode.delete_semantics())
}

/// Derives the queue declare argument table from the consumer options.
pub(crate) fn queue_declare_arguments(
    opts: &ConsumerOptions,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(limit) = opts.queue_size_limit {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(limit)),
        );
    }

    if let Some(exchange) = &opts.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(routing_key) = &opts.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key.clone())),
        );
    }

    match opts.queue_mode {
        QueueMode::Default => {}
        QueueMode::Lazy => {
            args.insert(
                ShortString::from(AMQP_HEADERS_QUEUE_MODE),
                AMQPValue::LongString(LongString::from("lazy")),
            );
        }
        QueueMode::Quorum => {
            args.insert(
                ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from("quorum")),
            );
        }
    }

    if let Some(priority) = opts.queue_max_priority {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(priority as i32)),
        );
    }

    args
}

/// Brings a mailbox's exchange into the requested state.
pub(crate) struct ExchangeResource<'tp> {
    channel: &'tp Channel,
    options: &'tp MailboxOptions,
    consumer_options: &'tp ConsumerOptions,
    state: ResourceState,
}

impl<'tp> ExchangeResource<'tp> {
    pub(crate) fn new(
        channel: &'tp Channel,
        options: &'tp MailboxOptions,
        consumer_options: &'tp ConsumerOptions,
    ) -> Self {
        ExchangeResource {
            channel,
            options,
            consumer_options,
            state: ResourceState::default(),
        }
    }

    pub(crate) async fn ensure(&mut self) -> Result<(), AmqpError> {
        let Some(kind) = self.options.exchange_type.declarable_kind() else {
            debug!(
                exchange = self.options.exchange_name,
                "rpc mailboxes publish through the default exchange, nothing to declare"
            );
            return Ok(());
        };

        let mode = self.consumer_options.exchange_recreate_mode;
        if mode.forces_predelete() {
            let (if_unused, _) = mode.delete_semantics();
            self.delete(if_unused).await?;
        }

        debug!("creating exchange: {}", self.options.exchange_name);

        loop {
            match self.declare(kind.clone()).await {
                Ok(()) => {
                    debug!("exchange: {} was created", self.options.exchange_name);
                    return Ok(());
                }
                Err(err) => match classify_error(&err) {
                    BrokerFault::IncompatibleArguments => {
                        warn!(
                            exchange = self.options.exchange_name,
                            "incompatible redeclare detected on exchange"
                        );
                        let (if_unused, _) = plan_recovery(
                            mode,
                            &mut self.state,
                            &self.options.exchange_name,
                            &err.to_string(),
                        )?;
                        self.delete(if_unused).await?;
                    }
                    _ => {
                        error!(
                            error = err.to_string(),
                            name = self.options.exchange_name,
                            "error to declare the exchange"
                        );
                        return Err(AmqpError::DeclareExchangeError(
                            self.options.exchange_name.clone(),
                        ));
                    }
                },
            }
        }
    }

    async fn declare(&self, kind: lapin::ExchangeKind) -> Result<(), lapin::Error> {
        self.channel
            .exchange_declare(
                &self.options.exchange_name,
                kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: self.consumer_options.exchange_durable,
                    auto_delete: self.consumer_options.exchange_auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
    }

    async fn delete(&self, if_unused: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_delete(
                &self.options.exchange_name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error to delete the exchange");
                Err(AmqpError::DeleteResourceError(
                    self.options.exchange_name.clone(),
                ))
            }
        }
    }
}

/// Brings a mailbox's queue into the requested state and binds it.
pub(crate) struct QueueResource<'tp> {
    channel: &'tp Channel,
    options: &'tp MailboxOptions,
    consumer_options: &'tp ConsumerOptions,
    state: ResourceState,
}

impl<'tp> QueueResource<'tp> {
    pub(crate) fn new(
        channel: &'tp Channel,
        options: &'tp MailboxOptions,
        consumer_options: &'tp ConsumerOptions,
    ) -> Self {
        QueueResource {
            channel,
            options,
            consumer_options,
            state: ResourceState::default(),
        }
    }

    pub(crate) async fn ensure(&mut self) -> Result<(), AmqpError> {
        if self.options.exchange_type == ExchangeType::RpcClient {
            debug!("rpc client mailboxes use the direct-reply pseudo queue, nothing to declare");
            return Ok(());
        }

        let mode = self.consumer_options.queue_recreate_mode;
        if mode.forces_predelete() {
            let (if_unused, if_empty) = mode.delete_semantics();
            self.delete(if_unused, if_empty).await?;
        }

        debug!("creating queue: {}", self.options.queue_name);

        loop {
            if let Err(err) = self.declare().await {
                match classify_error(&err) {
                    BrokerFault::IncompatibleArguments => {
                        warn!(
                            queue = self.options.queue_name,
                            "incompatible redeclare detected on queue"
                        );
                        let (if_unused, if_empty) = plan_recovery(
                            mode,
                            &mut self.state,
                            &self.options.queue_name,
                            &err.to_string(),
                        )?;
                        self.delete(if_unused, if_empty).await?;
                        continue;
                    }
                    _ => {
                        error!(error = err.to_string(), "error to declare the queue");
                        return Err(AmqpError::DeclareQueueError(self.options.queue_name.clone()));
                    }
                }
            }

            debug!("queue: {} was created", self.options.queue_name);

            match self.bind().await {
                Ok(()) => return Ok(()),
                Err(err) => match classify_error(&err) {
                    BrokerFault::IncompatibleArguments => {
                        let (if_unused, if_empty) = plan_recovery(
                            mode,
                            &mut self.state,
                            &self.options.queue_name,
                            &err.to_string(),
                        )?;
                        self.delete(if_unused, if_empty).await?;
                    }
                    BrokerFault::NotFound | BrokerFault::ResourceLocked => {
                        warn!(
                            error = err.to_string(),
                            queue = self.options.queue_name,
                            "expected binding failure, continuing"
                        );
                        return Ok(());
                    }
                    BrokerFault::Unknown => {
                        error!(error = err.to_string(), "error to bind queue to exchange");
                        return Err(AmqpError::BindingError(
                            self.options.queue_name.clone(),
                            self.options.exchange_name.clone(),
                        ));
                    }
                },
            }
        }
    }

    async fn declare(&self) -> Result<(), lapin::Error> {
        let args = queue_declare_arguments(self.consumer_options);

        // RPC server queues are always exclusive to their consumer
        let exclusive = self.options.exchange_type == ExchangeType::RpcServer
            || self.consumer_options.queue_exclusive;

        self.channel
            .queue_declare(
                &self.options.queue_name,
                QueueDeclareOptions {
                    passive: false,
                    durable: self.consumer_options.queue_durable,
                    exclusive,
                    auto_delete: self.consumer_options.queue_auto_delete,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
            .map(|_| ())
    }

    async fn bind(&self) -> Result<(), lapin::Error> {
        if self.options.exchange_name.is_empty() {
            debug!("default exchange binds queues implicitly, skipping bind");
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.options.queue_name, self.options.exchange_name, self.options.routing_key
        );

        let mut bind_args = BTreeMap::new();
        for (key, value) in &self.options.queue_binding_headers {
            bind_args.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        self.channel
            .queue_bind(
                &self.options.queue_name,
                &self.options.exchange_name,
                &self.options.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::from(bind_args),
            )
            .await
    }

    async fn delete(&self, if_unused: bool, if_empty: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_delete(
                &self.options.queue_name,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    nowait: false,
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error to delete the queue");
                Err(AmqpError::DeleteResourceError(self.options.queue_name.clone()))
            }
        }
    }
}
