//! Core module: contexts, service definitions, events and async status

pub mod context;
pub mod definition;
pub mod disposable;
pub mod emitter;
pub mod event;
pub mod status;

pub use context::Context;
pub use definition::{DefaultFactory, Definition, DefinitionId, Service};
pub use disposable::{Disposable, Dispose};
pub use emitter::{EventEmitter, ListenerId};
pub use event::{ContextInfo, Direction, Event, EventBus, EventBusListener, EventWrapper, Routing};
pub use status::{AsyncServiceFactory, ServiceStatus, SharedError, StatusInfo, StatusReporter, StatusUpdateEvent};
pub use crate::impl_event;
