//! Error handling system

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("No context provided")]
    NoAmbientContext,

    #[error("Cannot find service \"{0}\" depended upon")]
    DependencyNotProvided(String),

    #[error("Tried to instantiate a service \"{0}\" but an instance of the service exists already")]
    DuplicateService(String),

    #[error("Service \"{0}\" has no default factory")]
    NoDefaultFactory(String),

    #[error("Context {0} has been disposed")]
    ContextDisposed(u64),

    #[error("MessageBridge disposed")]
    BridgeDisposed,

    #[error("{0}")]
    Client(String),

    #[error("Server Error: {0}")]
    Server(String),

    #[error("Request of type {0:?} not supported")]
    UnsupportedRequestType(String),

    #[error("Request handled already")]
    RequestAlreadyHandled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ScopeError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            ScopeError::NoAmbientContext => "no_ambient_context",
            ScopeError::DependencyNotProvided(_) => "dependency_not_provided",
            ScopeError::DuplicateService(_) => "duplicate_service",
            ScopeError::NoDefaultFactory(_) => "no_default_factory",
            ScopeError::ContextDisposed(_) => "context_disposed",
            ScopeError::BridgeDisposed => "bridge_disposed",
            ScopeError::Client(_) => "client_error",
            ScopeError::Server(_) => "server_error",
            ScopeError::UnsupportedRequestType(_) => "unsupported_request_type",
            ScopeError::RequestAlreadyHandled => "request_already_handled",
            ScopeError::Transport(_) => "transport_error",
            ScopeError::RuntimeError(_) => "runtime_error",
            ScopeError::Other(_) => "other",
            ScopeError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScopeError>;

pub trait ResultExt<T> {
    fn with_service(self, service: &str) -> Result<T>;
    fn with_request(self, request_type: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_service(self, service: &str) -> Result<T> {
        self.map_err(|e| match e {
            ScopeError::Internal(inner) => {
                ScopeError::Internal(inner.context(format!("while providing \"{}\"", service)))
            }
            ScopeError::Other(msg) => ScopeError::Other(format!("{} [service: {}]", msg, service)),
            other => other,
        })
    }

    fn with_request(self, request_type: &str) -> Result<T> {
        self.map_err(|e| match e {
            ScopeError::Transport(msg) => {
                ScopeError::Transport(format!("{} [request: {}]", msg, request_type))
            }
            other => other,
        })
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal) => {
        return Err($crate::error::ScopeError::Other($msg.to_string()))
    };
    ($err:expr) => {
        return Err($crate::error::ScopeError::Other($err.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::ScopeError::Other(format!($fmt, $($arg)*)))
    };
}
