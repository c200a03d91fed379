// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry and Dispatch Cache
//!
//! Routing from a wire type tag to an application handler. Handlers are bound
//! explicitly during application setup; each binding is a typed closure erased
//! behind one of the three capability variants (sync, async, RPC). Resolution
//! prefers an exact tag match over an alias match, memoizes hits in a
//! process-wide cache, and never memoizes misses, so a tag registered later is
//! picked up by subsequent deliveries.
//!
//! The registry is an owned object wired in by the composition root; nothing
//! here is global state.

use crate::{
    codec::{decode_payload, encode_payload, Codec},
    envelope::{Envelope, RawDelivery},
    errors::AmqpError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc};

/// Default wire type tag for a payload type.
///
/// Stable within one build of the application; deployments that mix processes
/// or languages should register and publish with explicit tags instead.
pub fn type_tag<T>() -> &'static str {
    std::any::type_name::<T>()
}

/// Handler capability a delivery can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Sync,
    Async,
    Rpc,
}

/// Object-safe message handler, the trait alternative to closure registration.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, envelope: Envelope<T>) -> Result<(), AmqpError>;
}

/// Object-safe RPC handler; `None` means no reply is sent.
#[async_trait]
pub trait RpcHandler<Req, Resp>: Send + Sync {
    async fn handle(&self, request: Req) -> Result<Option<Resp>, AmqpError>;
}

/// Reply produced by an RPC handler, already encoded for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub type_tag: String,
    pub body: Vec<u8>,
}

pub(crate) type SyncInvoker = dyn Fn(RawDelivery) -> Result<(), AmqpError> + Send + Sync;
pub(crate) type AsyncInvoker =
    dyn Fn(RawDelivery) -> BoxFuture<'static, Result<(), AmqpError>> + Send + Sync;
pub(crate) type RpcInvoker =
    dyn Fn(RawDelivery) -> BoxFuture<'static, Result<Option<OutboundReply>, AmqpError>>
        + Send
        + Sync;

/// A resolved, invokable handler binding.
#[derive(Clone)]
pub enum HandlerBinding {
    Sync(Arc<SyncInvoker>),
    Async(Arc<AsyncInvoker>),
    Rpc(Arc<RpcInvoker>),
}

impl HandlerBinding {
    pub(crate) fn kind(&self) -> HandlerKind {
        match self {
            HandlerBinding::Sync(_) => HandlerKind::Sync,
            HandlerBinding::Async(_) => HandlerKind::Async,
            HandlerBinding::Rpc(_) => HandlerKind::Rpc,
        }
    }
}

type DispatchKey = (String, HandlerKind);

/// Process-lifetime handler registry with its dispatch cache.
pub struct HandlerRegistry {
    codec: Arc<dyn Codec>,
    bindings: DashMap<DispatchKey, HandlerBinding>,
    aliases: DashMap<DispatchKey, String>,
    cache: DashMap<DispatchKey, HandlerBinding>,
}

impl HandlerRegistry {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        HandlerRegistry {
            codec,
            bindings: DashMap::new(),
            aliases: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    pub(crate) fn codec(&self) -> Arc<dyn Codec> {
        self.codec.clone()
    }

    /// Binds a synchronous handler under the payload type's default tag.
    pub fn on_message<T, F>(&self, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Envelope<T>) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.on_message_tagged(type_tag::<T>(), handler);
    }

    /// Binds a synchronous handler under an explicit tag.
    pub fn on_message_tagged<T, F>(&self, tag: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Envelope<T>) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        let codec = self.codec.clone();
        let invoker: Arc<SyncInvoker> = Arc::new(move |raw: RawDelivery| {
            let payload: T = decode_payload(codec.as_ref(), &raw.data)?;
            handler(raw.into_envelope(payload))
        });

        self.insert(tag, HandlerBinding::Sync(invoker));
    }

    /// Binds an asynchronous handler under the payload type's default tag.
    pub fn on_message_async<T, F, Fut>(&self, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        self.on_message_async_tagged(type_tag::<T>(), handler);
    }

    /// Binds an asynchronous handler under an explicit tag.
    pub fn on_message_async_tagged<T, F, Fut>(&self, tag: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        let invoker: Arc<AsyncInvoker> = Arc::new(move |raw: RawDelivery| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let payload: T = decode_payload(codec.as_ref(), &raw.data)?;
                (*handler)(raw.into_envelope(payload)).await
            })
        });

        self.insert(tag, HandlerBinding::Async(invoker));
    }

    /// Binds a synchronous RPC handler under the request type's default tag.
    ///
    /// A `None` return means no reply is sent and the caller times out.
    pub fn on_rpc<Req, Resp, F>(&self, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Result<Option<Resp>, AmqpError> + Send + Sync + 'static,
    {
        self.on_rpc_tagged(type_tag::<Req>(), handler);
    }

    /// Binds a synchronous RPC handler under an explicit request tag.
    pub fn on_rpc_tagged<Req, Resp, F>(&self, tag: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Result<Option<Resp>, AmqpError> + Send + Sync + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        let invoker: Arc<RpcInvoker> = Arc::new(move |raw: RawDelivery| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = decode_payload(codec.as_ref(), &raw.data)?;
                match (*handler)(request)? {
                    Some(response) => Ok(Some(OutboundReply {
                        type_tag: type_tag::<Resp>().to_owned(),
                        body: encode_payload(codec.as_ref(), &response)?,
                    })),
                    None => Ok(None),
                }
            })
        });

        self.insert(tag, HandlerBinding::Rpc(invoker));
    }

    /// Binds an asynchronous RPC handler under the request type's default tag.
    pub fn on_rpc_async<Req, Resp, F, Fut>(&self, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Resp>, AmqpError>> + Send + 'static,
    {
        self.on_rpc_async_tagged(type_tag::<Req>(), handler);
    }

    /// Binds an asynchronous RPC handler under an explicit request tag.
    pub fn on_rpc_async_tagged<Req, Resp, F, Fut>(&self, tag: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Resp>, AmqpError>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        let invoker: Arc<RpcInvoker> = Arc::new(move |raw: RawDelivery| {
            let codec = codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = decode_payload(codec.as_ref(), &raw.data)?;
                match (*handler)(request).await? {
                    Some(response) => Ok(Some(OutboundReply {
                        type_tag: type_tag::<Resp>().to_owned(),
                        body: encode_payload(codec.as_ref(), &response)?,
                    })),
                    None => Ok(None),
                }
            })
        });

        self.insert(tag, HandlerBinding::Rpc(invoker));
    }

    /// Binds a [`MessageHandler`] trait object under the payload type's
    /// default tag.
    pub fn on_handler<T>(&self, handler: Arc<dyn MessageHandler<T>>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.on_handler_tagged(type_tag::<T>(), handler);
    }

    /// Binds a [`MessageHandler`] trait object under an explicit tag.
    pub fn on_handler_tagged<T>(&self, tag: &str, handler: Arc<dyn MessageHandler<T>>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.on_message_async_tagged::<T, _, _>(tag, move |envelope| {
            let handler = handler.clone();
            async move { handler.handle(envelope).await }
        });
    }

    /// Binds an [`RpcHandler`] trait object under the request type's default
    /// tag.
    pub fn on_rpc_handler<Req, Resp>(&self, handler: Arc<dyn RpcHandler<Req, Resp>>)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.on_rpc_handler_tagged(type_tag::<Req>(), handler);
    }

    /// Binds an [`RpcHandler`] trait object under an explicit request tag.
    pub fn on_rpc_handler_tagged<Req, Resp>(&self, tag: &str, handler: Arc<dyn RpcHandler<Req, Resp>>)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.on_rpc_async_tagged::<Req, Resp, _, _>(tag, move |request| {
            let handler = handler.clone();
            async move { handler.handle(request).await }
        });
    }

    /// Declares `alias_tag` dispatchable to the handler registered under
    /// `primary_tag` for the given kind. An exact registration always beats an
    /// alias; the first alias for a tag wins.
    pub fn alias(&self, alias_tag: &str, primary_tag: &str, kind: HandlerKind) {
        self.aliases
            .entry((alias_tag.to_owned(), kind))
            .or_insert_with(|| primary_tag.to_owned());
    }

    /// Resolves the binding for a (tag, kind) pair.
    ///
    /// Distinguishes an unknown tag ([`AmqpError::PayloadTypeUnresolvable`])
    /// from a known tag with no binding of the requested kind
    /// ([`AmqpError::HandlerNotFound`]).
    pub(crate) fn resolve(&self, tag: &str, kind: HandlerKind) -> Result<HandlerBinding, AmqpError> {
        let key = (tag.to_owned(), kind);

        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.value().clone());
        }

        let exact = self.bindings.get(&key).map(|b| b.value().clone());
        let resolved = exact.or_else(|| {
            self.aliases.get(&key).and_then(|primary| {
                self.bindings
                    .get(&(primary.value().clone(), kind))
                    .map(|b| b.value().clone())
            })
        });

        match resolved {
            Some(binding) => {
                self.cache.insert(key, binding.clone());
                Ok(binding)
            }
            None if self.tag_known(tag) => Err(AmqpError::HandlerNotFound(tag.to_owned())),
            None => Err(AmqpError::PayloadTypeUnresolvable(tag.to_owned())),
        }
    }

    /// Resolves a consumer delivery: the async binding is probed first, then
    /// the sync one.
    pub(crate) fn resolve_consumer(&self, tag: &str) -> Result<HandlerBinding, AmqpError> {
        match self.resolve(tag, HandlerKind::Async) {
            Ok(binding) => Ok(binding),
            Err(AmqpError::PayloadTypeUnresolvable(tag)) => {
                Err(AmqpError::PayloadTypeUnresolvable(tag))
            }
            Err(_) => self.resolve(tag, HandlerKind::Sync),
        }
    }

    fn insert(&self, tag: &str, binding: HandlerBinding) {
        let key = (tag.to_owned(), binding.kind());
        self.cache.remove(&key);
        self.bindings.insert(key, binding);
    }

    fn tag_known(&self, tag: &str) -> bool {
        const KINDS: [HandlerKind; 3] = [HandlerKind::Sync, HandlerKind::Async, HandlerKind::Rpc];

        KINDS.iter().any(|kind| {
            let key = (tag.to_owned(), *kind);
            self.bindings.contains_key(&key) || self.aliases.contains_key(&key)
        })
    }

    #[cfg(test)]
    pub(crate) fn cached_resolutions(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::JsonCodec, envelope::MessageMeta};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        value: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong {
        value: u32,
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(Arc::new(JsonCodec))
    }

    fn raw(tag: &str, data: &[u8]) -> RawDelivery {
        RawDelivery {
            data: data.to_vec(),
            exchange: "direct".to_owned(),
            routing_key: "k".to_owned(),
            consumer_tag: "t(1)".to_owned(),
            delivery_tag: 1,
            redelivered: false,
            meta: MessageMeta {
                type_tag: tag.to_owned(),
                ..MessageMeta::default()
            },
        }
    }

    #[test]
    fn unknown_tag_is_unresolvable() {
        let reg = registry();
        assert!(matches!(
            reg.resolve("nope", HandlerKind::Sync),
            Err(AmqpError::PayloadTypeUnresolvable(_))
        ));
    }

    #[test]
    fn known_tag_without_kind_is_handler_not_found() {
        let reg = registry();
        reg.on_message_tagged::<Ping, _>("ping", |_| Ok(()));

        assert!(matches!(
            reg.resolve("ping", HandlerKind::Rpc),
            Err(AmqpError::HandlerNotFound(_))
        ));
    }

    #[test]
    fn hits_are_memoized_misses_are_not() {
        let reg = registry();

        assert!(reg.resolve("ping", HandlerKind::Sync).is_err());
        assert_eq!(reg.cached_resolutions(), 0);

        reg.on_message_tagged::<Ping, _>("ping", |_| Ok(()));

        // the earlier miss must not shadow the new registration
        assert!(reg.resolve("ping", HandlerKind::Sync).is_ok());
        assert_eq!(reg.cached_resolutions(), 1);

        assert!(reg.resolve("ping", HandlerKind::Sync).is_ok());
        assert_eq!(reg.cached_resolutions(), 1);
    }

    #[test]
    fn exact_match_beats_alias() {
        let reg = registry();
        let exact_hits = Arc::new(AtomicU32::new(0));
        let alias_hits = Arc::new(AtomicU32::new(0));

        let hits = alias_hits.clone();
        reg.on_message_tagged::<Ping, _>("primary", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let hits = exact_hits.clone();
        reg.on_message_tagged::<Ping, _>("ping", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        reg.alias("ping", "primary", HandlerKind::Sync);

        let binding = reg.resolve("ping", HandlerKind::Sync).unwrap();
        match binding {
            HandlerBinding::Sync(f) => (*f)(raw("ping", b"{\"value\":1}")).unwrap(),
            _ => panic!("expected sync binding"),
        }

        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(alias_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_alias_wins() {
        let reg = registry();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let hits = first.clone();
        reg.on_message_tagged::<Ping, _>("a", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let hits = second.clone();
        reg.on_message_tagged::<Ping, _>("b", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        reg.alias("legacy", "a", HandlerKind::Sync);
        reg.alias("legacy", "b", HandlerKind::Sync);

        match reg.resolve("legacy", HandlerKind::Sync).unwrap() {
            HandlerBinding::Sync(f) => (*f)(raw("legacy", b"{\"value\":1}")).unwrap(),
            _ => panic!("expected sync binding"),
        }

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn consumer_resolution_prefers_async() {
        let reg = registry();
        let sync_hits = Arc::new(AtomicU32::new(0));

        let hits = sync_hits.clone();
        reg.on_message_tagged::<Ping, _>("ping", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        reg.on_message_async_tagged::<Ping, _, _>("ping", |_| async { Ok(()) });

        assert_eq!(
            reg.resolve_consumer("ping").unwrap().kind(),
            HandlerKind::Async
        );
    }

    #[tokio::test]
    async fn rpc_invoker_encodes_reply_with_response_tag() {
        let reg = registry();
        reg.on_rpc_tagged::<Ping, Pong, _>("ping", |req| Ok(Some(Pong { value: req.value + 1 })));

        let reply = match reg.resolve("ping", HandlerKind::Rpc).unwrap() {
            HandlerBinding::Rpc(f) => (*f)(raw("ping", b"{\"value\":41}")).await.unwrap(),
            _ => panic!("expected rpc binding"),
        }
        .expect("handler returned a response");

        assert_eq!(reply.type_tag, type_tag::<Pong>());
        let decoded: Pong = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(decoded.value, 42);
    }

    #[tokio::test]
    async fn rpc_handler_can_decline_to_reply() {
        let reg = registry();
        reg.on_rpc_tagged::<Ping, Pong, _>("ping", |_| Ok(None));

        let reply = match reg.resolve("ping", HandlerKind::Rpc).unwrap() {
            HandlerBinding::Rpc(f) => (*f)(raw("ping", b"{\"value\":1}")).await.unwrap(),
            _ => panic!("expected rpc binding"),
        };

        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn async_invoker_decodes_payload() {
        let reg = registry();
        let seen = Arc::new(AtomicU32::new(0));

        let captured = seen.clone();
        reg.on_message_async_tagged::<Ping, _, _>("ping", move |env| {
            let captured = captured.clone();
            async move {
                captured.store(env.payload.value, Ordering::SeqCst);
                Ok(())
            }
        });

        match reg.resolve("ping", HandlerKind::Async).unwrap() {
            HandlerBinding::Async(f) => (*f)(raw("ping", b"{\"value\":9}")).await.unwrap(),
            _ => panic!("expected async binding"),
        }

        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn trait_handlers_dispatch_like_closures() {
        struct Recorder(AtomicU32);

        #[async_trait::async_trait]
        impl MessageHandler<Ping> for Recorder {
            async fn handle(&self, envelope: Envelope<Ping>) -> Result<(), AmqpError> {
                self.0.store(envelope.payload.value, Ordering::SeqCst);
                Ok(())
            }
        }

        #[async_trait::async_trait]
        impl RpcHandler<Ping, Pong> for Recorder {
            async fn handle(&self, request: Ping) -> Result<Option<Pong>, AmqpError> {
                Ok(Some(Pong {
                    value: request.value + 1,
                }))
            }
        }

        let reg = registry();
        let recorder = Arc::new(Recorder(AtomicU32::new(0)));

        reg.on_handler_tagged::<Ping>("ping", recorder.clone());
        reg.on_rpc_handler_tagged::<Ping, Pong>("ping", recorder.clone());

        match reg.resolve("ping", HandlerKind::Async).unwrap() {
            HandlerBinding::Async(f) => (*f)(raw("ping", b"{\"value\":5}")).await.unwrap(),
            _ => panic!("expected async binding"),
        }
        assert_eq!(recorder.0.load(Ordering::SeqCst), 5);

        let reply = match reg.resolve("ping", HandlerKind::Rpc).unwrap() {
            HandlerBinding::Rpc(f) => (*f)(raw("ping", b"{\"value\":5}")).await.unwrap(),
            _ => panic!("expected rpc binding"),
        }
        .expect("handler replied");
        let decoded: Pong = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(decoded.value, 6);
    }

    #[test]
    fn sync_invoker_reports_malformed_payload() {
        let reg = registry();
        reg.on_message_tagged::<Ping, _>("ping", |_| Ok(()));

        let err = match reg.resolve("ping", HandlerKind::Sync).unwrap() {
            HandlerBinding::Sync(f) => (*f)(raw("ping", b"not json")).unwrap_err(),
            _ => panic!("expected sync binding"),
        };

        assert!(matches!(err, AmqpError::DeserializeError(_)));
    }
}
