//! Request/response messaging over one-way transports

pub mod config;
pub mod id;
pub mod message;
pub mod message_bridge;
pub mod transport;

pub use config::BridgeConfig;
pub use id::{IdProvider, IncrementalIdProvider, UuidIdProvider, ID_PROVIDER};
pub use message::{Message, RequestHandle, RequestHandler};
pub use message_bridge::{ClientError, MessageBridge, MESSAGE_BRIDGE};
pub use transport::{ChannelTransport, LoopbackTransport, Transport};
