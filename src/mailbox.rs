// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Mailbox Assembly
//!
//! A mailbox ties a descriptor, consumer options, the handler registry, and a
//! channel together: the exchange and queue are ensured first, then the
//! consumer engine starts on the queue. Construction-time failures (invalid
//! options, resource conflicts) propagate synchronously to the caller.
//!
//! [`MailboxService`] is the convenience surface for creating mailboxes of
//! each kind from one configuration, channel, and registry.

use crate::{
    config::AmqpConfig,
    consumer::{next_consumer_tag, ConsumerEngine, ConsumerHandle},
    dispatch::HandlerRegistry,
    errors::AmqpError,
    options::{ConsumerOptions, MailboxOptions, XMatch},
    publisher::Producer,
    rpc::RpcClient,
    topology::{ExchangeResource, QueueResource},
};
use lapin::Channel;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// A running subscription and the resources backing it.
pub struct Mailbox {
    options: MailboxOptions,
    consumer_options: ConsumerOptions,
    handle: ConsumerHandle,
}

impl Mailbox {
    /// Ensures the mailbox's resources and starts its consumer engine.
    pub async fn open(
        channel: Arc<Channel>,
        config: &AmqpConfig,
        registry: Arc<HandlerRegistry>,
        options: MailboxOptions,
        consumer_options: ConsumerOptions,
    ) -> Result<Mailbox, AmqpError> {
        ExchangeResource::new(&channel, &options, &consumer_options)
            .ensure()
            .await?;
        QueueResource::new(&channel, &options, &consumer_options)
            .ensure()
            .await?;

        let consumer_tag = next_consumer_tag(&config.app_name);
        debug!(consumer_tag, queue = options.queue_name, "opening mailbox");

        let handle = ConsumerEngine::new(
            channel,
            options.clone(),
            consumer_options.clone(),
            registry,
            config.dispatcher_mode,
            consumer_tag,
        )
        .start()
        .await?;

        Ok(Mailbox {
            options,
            consumer_options,
            handle,
        })
    }

    pub fn options(&self) -> &MailboxOptions {
        &self.options
    }

    pub fn consumer_options(&self) -> &ConsumerOptions {
        &self.consumer_options
    }

    pub fn consumer_tag(&self) -> &str {
        self.handle.consumer_tag()
    }

    /// Receives the next handler failure of this mailbox's subscription.
    pub async fn next_fault(&mut self) -> Option<AmqpError> {
        self.handle.next_fault().await
    }

    /// Stops the subscription and disposes the mailbox.
    pub async fn close(self) {
        self.handle.stop().await;
    }
}

/// Creates mailboxes of each kind from one configuration, channel, and
/// registry. Owned by the composition root.
pub struct MailboxService {
    config: AmqpConfig,
    channel: Arc<Channel>,
    registry: Arc<HandlerRegistry>,
}

impl MailboxService {
    pub fn new(config: AmqpConfig, channel: Arc<Channel>, registry: Arc<HandlerRegistry>) -> Self {
        MailboxService {
            config,
            channel,
            registry,
        }
    }

    /// A publisher sharing this service's channel and codec.
    pub fn producer(&self) -> Arc<Producer> {
        Producer::new(self.channel.clone(), self.registry.codec())
    }

    /// Direct mailbox on an exact routing key.
    pub async fn direct(
        &self,
        routing_key: &str,
        queue_name: &str,
        consumer_options: Option<ConsumerOptions>,
    ) -> Result<Mailbox, AmqpError> {
        self.open(
            MailboxOptions::direct(routing_key, queue_name)?,
            consumer_options.unwrap_or_default(),
        )
        .await
    }

    /// Topic mailbox on a dotted wildcard pattern.
    pub async fn topic(
        &self,
        routing_key: &str,
        queue_name: &str,
        consumer_options: Option<ConsumerOptions>,
    ) -> Result<Mailbox, AmqpError> {
        self.open(
            MailboxOptions::topic(routing_key, queue_name)?,
            consumer_options.unwrap_or_default(),
        )
        .await
    }

    /// Fanout mailbox receiving every message of its exchange.
    pub async fn fanout(
        &self,
        queue_name: &str,
        consumer_options: Option<ConsumerOptions>,
    ) -> Result<Mailbox, AmqpError> {
        self.open(
            MailboxOptions::fanout(queue_name)?,
            consumer_options.unwrap_or_default(),
        )
        .await
    }

    /// Headers mailbox matching all or any of the given headers.
    pub async fn headers(
        &self,
        headers: BTreeMap<String, String>,
        x_match: XMatch,
        queue_name: &str,
        consumer_options: Option<ConsumerOptions>,
    ) -> Result<Mailbox, AmqpError> {
        self.open(
            MailboxOptions::headers(headers, x_match, queue_name)?,
            consumer_options.unwrap_or_default(),
        )
        .await
    }

    /// RPC server mailbox: exclusive auto-deleting queue, requests dispatched
    /// to the registry's RPC bindings, replies correlated back to callers.
    pub async fn rpc_server(
        &self,
        queue_name: Option<&str>,
        consumer_options: Option<ConsumerOptions>,
    ) -> Result<Mailbox, AmqpError> {
        self.open(
            MailboxOptions::rpc_server(queue_name)?,
            consumer_options.unwrap_or_else(ConsumerOptions::rpc_server),
        )
        .await
    }

    /// RPC client bound to a server queue, replies over the direct-reply
    /// pseudo-queue.
    pub async fn rpc_client(
        &self,
        server_queue_name: Option<&str>,
        consumer_options: Option<ConsumerOptions>,
    ) -> Result<RpcClient, AmqpError> {
        let options = MailboxOptions::rpc_client(server_queue_name)?;

        let call_timeout = consumer_options
            .map(|co| co.rpc_call_timeout)
            .unwrap_or(self.config.rpc_call_timeout);

        RpcClient::start(
            self.channel.clone(),
            self.registry.codec(),
            options,
            call_timeout,
            next_consumer_tag(&self.config.app_name),
        )
        .await
    }

    async fn open(
        &self,
        options: MailboxOptions,
        consumer_options: ConsumerOptions,
    ) -> Result<Mailbox, AmqpError> {
        Mailbox::open(
            self.channel.clone(),
            &self.config,
            self.registry.clone(),
            options,
            consumer_options,
        )
        .await
    }
}
