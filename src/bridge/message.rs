//! Wire messages and inbound request handles

use crate::error::{Result, ScopeError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

/// Message exchanged between two bridges.
///
/// ```json
/// {"direction": "request",  "id": "0", "type": "ping", "data": {"x": 1}}
/// {"direction": "response", "id": "0", "data": {"y": 2}, "error": null}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum Message {
    Request {
        id: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => id,
        }
    }

    pub fn direction(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
        }
    }
}

pub type RequestHandler = Box<dyn FnOnce(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// An inbound request offered to `on_request` listeners.
///
/// The first listener to call [`RequestHandle::handle`] claims the request.
pub struct RequestHandle {
    kind: String,
    data: Value,
    handled: AtomicBool,
    handler: Mutex<Option<RequestHandler>>,
}

impl RequestHandle {
    pub(crate) fn new(kind: String, data: Value) -> Self {
        Self {
            kind,
            data,
            handled: AtomicBool::new(false),
            handler: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    /// Claims the request. `handler` receives the request data and its
    /// outcome becomes the response.
    pub fn handle<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.handled.swap(true, Ordering::AcqRel) {
            return Err(ScopeError::RequestAlreadyHandled);
        }
        *self.handler.lock() = Some(Box::new(move |data| handler(data).boxed()));
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (String, Value, Option<RequestHandler>) {
        (self.kind, self.data, self.handler.into_inner())
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("kind", &self.kind)
            .field("handled", &self.is_handled())
            .finish()
    }
}
