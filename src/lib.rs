//! Synapse Scope - hierarchical service contexts
//!
//! Scoped dependency lookup, a directional event bus shared by each context
//! tree, an async provisioning status tracker and a request/response message
//! bridge over one-way transports.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod core;
pub mod error;

pub mod prelude {
    //! Commonly used types and traits

    pub use crate::bridge::{
        BridgeConfig, ClientError, IdProvider, Message, MessageBridge, RequestHandle, Transport, ID_PROVIDER,
    };
    pub use crate::core::{Context, Definition, DefinitionId, Service};
    pub use crate::core::{Direction, Event, EventBus, EventBusListener, Routing};
    pub use crate::core::{Disposable, Dispose, EventEmitter};
    pub use crate::core::{AsyncServiceFactory, ServiceStatus, StatusInfo, StatusReporter};
    pub use crate::error::{Result, ResultExt, ScopeError};
    pub use crate::impl_event;
    pub use async_trait::async_trait;
}

pub use core::{Context, Definition, Event, Service};
pub use error::{Result, ScopeError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn build_info() -> String {
    format!("Synapse Scope {}", VERSION)
}

/// Fails unless called from within a tokio runtime.
pub fn runtime_check() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(ScopeError::RuntimeError(
            "No Tokio runtime found. Use #[tokio::main]".to_string(),
        ));
    }
    Ok(())
}
