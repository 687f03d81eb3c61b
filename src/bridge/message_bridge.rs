//! Request/response correlation
//!
//! Flow:
//! 1. `send_request` takes an id from the context's [`IdProvider`]
//! 2. A oneshot sender is parked under that id
//! 3. The request goes out through the [`Transport`]
//! 4. The peer's response arrives via [`MessageBridge::deliver`] and settles
//!    the parked sender

use crate::bridge::config::BridgeConfig;
use crate::bridge::id::{IdProvider, IncrementalIdProvider, ID_PROVIDER};
use crate::bridge::message::{Message, RequestHandle};
use crate::bridge::transport::{LoopbackTransport, Transport};
use crate::core::context::Context;
use crate::core::definition::{Definition, Service};
use crate::core::disposable::{Disposable, Dispose};
use crate::core::emitter::EventEmitter;
use crate::error::{Result, ResultExt, ScopeError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Handler failure whose message is sent to the requester verbatim.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ClientError(pub String);

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub static MESSAGE_BRIDGE: LazyLock<Definition<MessageBridge>> =
    LazyLock::new(|| Definition::new("MessageBridge"));

type PendingSender = oneshot::Sender<Result<Value>>;

pub struct MessageBridge {
    context: Context,
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    /// Every inbound message, before it is processed.
    pub on_message: EventEmitter<Message>,
    pub on_request: EventEmitter<RequestHandle>,
    pending: Mutex<HashMap<String, PendingSender>>,
    fallback_ids: IncrementalIdProvider,
    lifetime: Disposable,
}

impl MessageBridge {
    pub fn new(context: Context, transport: Arc<dyn Transport>, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self::build(context, transport, config))
    }

    /// Bridge whose requests are answered by its own `on_request` listeners.
    pub fn loopback(context: Context, config: BridgeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let transport = Arc::new(LoopbackTransport::new(weak.clone()));
            Self::build(context, transport, config)
        })
    }

    fn build(context: Context, transport: Arc<dyn Transport>, config: BridgeConfig) -> Self {
        Self {
            context,
            transport,
            config,
            on_message: EventEmitter::new(),
            on_request: EventEmitter::new(),
            pending: Mutex::new(HashMap::new()),
            fallback_ids: IncrementalIdProvider::new(),
            lifetime: Disposable::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_disposed(&self) -> bool {
        self.lifetime.is_disposed()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn next_id(&self) -> String {
        match self.context.try_inject(&ID_PROVIDER) {
            Some(provider) => provider.next_id(),
            None => self.fallback_ids.next_id(),
        }
    }

    /// Sends a request and waits for the matching response.
    pub async fn send_request(&self, kind: &str, data: Value) -> Result<Value> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.lifetime.is_disposed() {
                return Err(ScopeError::BridgeDisposed);
            }
            pending.insert(id.clone(), tx);
        }
        let _entry = PendingEntry {
            pending: &self.pending,
            id: &id,
        };
        debug!(request_id = %id, request_type = kind, "Sending request");

        let message = Message::Request {
            id: id.clone(),
            kind: kind.to_string(),
            data,
        };
        if let Err(e) = self.transport.send(message).await {
            return Err(e).with_request(kind);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ScopeError::BridgeDisposed),
        }
    }

    /// Feeds one inbound message to the bridge.
    pub fn deliver(&self, message: Message) {
        if self.lifetime.is_disposed() {
            debug!(message_id = message.id(), "Bridge disposed, dropping message");
            return;
        }

        self.on_message.emit(&message);

        match message {
            Message::Request { id, kind, data } => self.dispatch_request(id, kind, data),
            Message::Response { id, data, error } => self.settle(&id, data, error),
        }
    }

    /// Forwards messages from `inbound` into [`MessageBridge::deliver`] until
    /// the channel closes or the bridge is dropped.
    pub fn attach(self: &Arc<Self>, mut inbound: mpsc::Receiver<Message>) -> Result<JoinHandle<()>> {
        crate::runtime_check()?;
        let bridge = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(bridge) = bridge.upgrade() else {
                    break;
                };
                bridge.deliver(message);
            }
        }))
    }

    fn dispatch_request(&self, id: String, kind: String, data: Value) {
        let handle = RequestHandle::new(kind, data);
        self.on_request.emit(&handle);
        let (kind, data, handler) = handle.into_parts();

        match handler {
            Some(handler) => {
                let config = self.config.clone();
                self.reply(id, async move {
                    match handler(data).await {
                        Ok(data) => (data, None),
                        Err(e) => (Value::Null, Some(failure_message(&e, &config, &kind))),
                    }
                });
            }
            None => {
                let e = ScopeError::UnsupportedRequestType(kind);
                error!(request_id = %id, error = %e, "Unhandled request");
                let message = e.to_string();
                self.reply(id, async move { (Value::Null, Some(message)) });
            }
        }
    }

    fn reply<F>(&self, id: String, outcome: F)
    where
        F: Future<Output = (Value, Option<String>)> + Send + 'static,
    {
        if let Err(e) = crate::runtime_check() {
            error!(request_id = %id, error = %e, "Cannot answer request");
            return;
        }

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let (data, error) = outcome.await;
            let response = Message::Response {
                id: id.clone(),
                data,
                error,
            };
            if let Err(e) = transport.send(response).await {
                error!(request_id = %id, error = %e, "Failed to send response");
            }
        });
    }

    fn settle(&self, id: &str, data: Value, error: Option<String>) {
        let Some(sender) = self.pending.lock().remove(id) else {
            debug!(request_id = id, "Response for unknown request id");
            return;
        };

        let outcome = match error {
            Some(message) if !message.is_empty() => Err(ScopeError::Server(message)),
            _ => Ok(data),
        };
        if sender.send(outcome).is_err() {
            debug!(request_id = id, "Requester went away before the response");
        }
    }
}

/// Removes a request's pending entry when `send_request` returns or its
/// future is dropped.
struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<String, PendingSender>>,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(self.id).is_some() {
            debug!(request_id = self.id, "Abandoned pending request");
        }
    }
}

/// Reply text for a failed handler. Anything but a client error is logged
/// here and, with obfuscation on, replaced by the configured message.
fn failure_message(error: &anyhow::Error, config: &BridgeConfig, kind: &str) -> String {
    if let Some(client) = error.downcast_ref::<ClientError>() {
        return client.to_string();
    }
    if let Some(ScopeError::Client(message)) = error.downcast_ref::<ScopeError>() {
        return message.clone();
    }

    error!(request_type = kind, error = %format!("{error:#}"), "Request handler failed");
    if config.obfuscate_internal_errors {
        config.internal_error_message.clone()
    } else {
        error.to_string()
    }
}

impl Service for MessageBridge {
    fn as_dispose(&self) -> Option<&dyn Dispose> {
        Some(self)
    }
}

impl Dispose for MessageBridge {
    fn dispose(&self) {
        let pending: Vec<(String, PendingSender)> = {
            let mut pending = self.pending.lock();
            self.lifetime.dispose();
            pending.drain().collect()
        };

        for (id, sender) in pending {
            debug!(request_id = %id, "Rejecting pending request");
            let _ = sender.send(Err(ScopeError::BridgeDisposed));
        }
        self.on_message.clear();
        self.on_request.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::ChannelTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn answer_pings(bridge: &MessageBridge) {
        bridge.on_request.add(None, |request| {
            if request.kind() == "ping" {
                request
                    .handle(|data| async move { Ok(json!({"y": data["x"].as_i64().unwrap_or(0) + 1})) })
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        answer_pings(&bridge);

        let response = bridge.send_request("ping", json!({"x": 1})).await.unwrap();

        assert_eq!(response, json!({"y": 2}));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_request_rejected() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        answer_pings(&bridge);

        let err = bridge.send_request("pong", json!(null)).await.unwrap_err();

        assert!(matches!(err, ScopeError::Server(_)));
        assert_eq!(err.to_string(), "Server Error: Request of type \"pong\" not supported");
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        bridge.on_request.add(None, |request| {
            let delay = request.data()["delay"].as_u64().unwrap_or(0);
            request
                .handle(move |data| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    Ok(data["tag"].clone())
                })
                .unwrap();
        });

        let (slow, fast) = tokio::join!(
            bridge.send_request("echo", json!({"tag": "slow", "delay": 30})),
            bridge.send_request("echo", json!({"tag": "fast", "delay": 0})),
        );

        assert_eq!(slow.unwrap(), json!("slow"));
        assert_eq!(fast.unwrap(), json!("fast"));
    }

    #[tokio::test]
    async fn test_client_error_passes_through() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        bridge.on_request.add(None, |request| {
            let failure = request.kind().to_string();
            request
                .handle(move |_| async move {
                    match failure.as_str() {
                        "login" => Err(ClientError::new("Wrong password").into()),
                        _ => Err(anyhow::anyhow!("database connection string leaked")),
                    }
                })
                .unwrap();
        });

        let err = bridge.send_request("login", json!(null)).await.unwrap_err();
        assert_eq!(err.to_string(), "Server Error: Wrong password");

        let err = bridge.send_request("query", json!(null)).await.unwrap_err();
        assert_eq!(err.to_string(), "Server Error: Internal server error");
    }

    #[tokio::test]
    async fn test_obfuscation_disabled() {
        let config = BridgeConfig::new().with_obfuscation(false);
        let bridge = MessageBridge::loopback(Context::new(), config);
        bridge.on_request.add(None, |request| {
            request
                .handle(|_| async { Err(anyhow::anyhow!("disk full")) })
                .unwrap();
        });

        let err = bridge.send_request("save", json!(null)).await.unwrap_err();
        assert_eq!(err.to_string(), "Server Error: disk full");
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        bridge.on_request.add(None, move |request| {
            let gate = gate.clone();
            request
                .handle(move |data| async move {
                    gate.notified().await;
                    Ok(data)
                })
                .unwrap();
        });

        let waiting = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.send_request("slow", json!(1)).await })
        };
        while bridge.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        bridge.dispose();
        release.notify_one();

        assert!(matches!(waiting.await.unwrap(), Err(ScopeError::BridgeDisposed)));
        assert!(matches!(
            bridge.send_request("slow", json!(1)).await,
            Err(ScopeError::BridgeDisposed)
        ));
    }

    #[tokio::test]
    async fn test_context_dispose_disposes_bridge() {
        let context = Context::new();
        let bridge = context
            .provide(&MESSAGE_BRIDGE, |ctx| {
                Ok(MessageBridge::loopback(ctx.clone(), BridgeConfig::default()))
            })
            .unwrap();

        context.dispose();

        assert!(bridge.is_disposed());
    }

    #[tokio::test]
    async fn test_ids_from_context_provider() {
        struct FixedIds(AtomicU32);
        impl Service for FixedIds {}
        impl IdProvider for FixedIds {
            fn next_id(&self) -> String {
                format!("req-{}", self.0.fetch_add(1, Ordering::SeqCst))
            }
        }

        let context = Context::new();
        context
            .provide(&ID_PROVIDER, |_| Ok(Arc::new(FixedIds(AtomicU32::new(10))) as Arc<dyn IdProvider>))
            .unwrap();
        let bridge = MessageBridge::loopback(context.child(), BridgeConfig::default());
        answer_pings(&bridge);

        let ids = Arc::new(Mutex::new(Vec::new()));
        let ids_clone = ids.clone();
        bridge.on_message.add(None, move |message| {
            ids_clone.lock().push(message.id().to_string());
        });

        bridge.send_request("ping", json!({"x": 0})).await.unwrap();

        assert_eq!(*ids.lock(), vec!["req-10".to_string(), "req-10".to_string()]);
    }

    #[tokio::test]
    async fn test_timed_out_requests_leave_no_pending() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        bridge.on_request.add(None, |request| {
            request
                .handle(|_| std::future::pending::<anyhow::Result<Value>>())
                .unwrap();
        });

        for _ in 0..5 {
            let result = tokio::time::timeout(
                std::time::Duration::from_millis(5),
                bridge.send_request("slow", json!(null)),
            )
            .await;
            assert!(result.is_err());
        }

        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_error_counts_as_success() {
        let ((transport, _), (_, mut peer_inbound)) = ChannelTransport::pair(4);
        let bridge = MessageBridge::new(Context::new(), Arc::new(transport), BridgeConfig::default());

        let waiting = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.send_request("ping", json!(null)).await })
        };
        let Some(Message::Request { id, .. }) = peer_inbound.recv().await else {
            panic!("expected a request");
        };
        bridge.deliver(Message::Response {
            id,
            data: json!(5),
            error: Some(String::new()),
        });

        assert_eq!(waiting.await.unwrap().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_unknown_response_ignored() {
        let bridge = MessageBridge::loopback(Context::new(), BridgeConfig::default());
        bridge.deliver(Message::Response {
            id: "nobody".to_string(),
            data: json!(null),
            error: None,
        });
        assert_eq!(bridge.pending_count(), 0);
    }

    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        async fn send(&self, _message: Message) -> Result<()> {
            Err(ScopeError::Transport("link down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_no_pending() {
        let bridge = MessageBridge::new(Context::new(), Arc::new(BrokenTransport), BridgeConfig::default());

        let err = bridge.send_request("ping", json!(null)).await.unwrap_err();

        assert_eq!(err.to_string(), "Transport error: link down [request: ping]");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_pair_bridges() {
        let ((left_transport, left_inbound), (right_transport, right_inbound)) = ChannelTransport::pair(16);
        let client = MessageBridge::new(Context::new(), Arc::new(left_transport), BridgeConfig::default());
        let server = MessageBridge::new(Context::new(), Arc::new(right_transport), BridgeConfig::default());
        client.attach(left_inbound).unwrap();
        server.attach(right_inbound).unwrap();
        answer_pings(&server);

        let response = client.send_request("ping", json!({"x": 41})).await.unwrap();
        assert_eq!(response, json!({"y": 42}));

        let err = server.send_request("ping", json!({"x": 0})).await.unwrap_err();
        assert!(matches!(err, ScopeError::Server(_)));
    }
}
