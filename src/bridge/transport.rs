//! Transport adapters
//!
//! A transport only moves one [`Message`] at a time towards the remote side.
//! Inbound traffic is handed to [`MessageBridge::deliver`] by whoever owns the
//! receiving end.

use crate::bridge::message::Message;
use crate::bridge::message_bridge::MessageBridge;
use crate::error::{Result, ScopeError};
use async_trait::async_trait;
use std::sync::Weak;
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

/// Delivers every sent message back to the bridge that sent it, after a
/// JSON round-trip.
pub struct LoopbackTransport {
    bridge: Weak<MessageBridge>,
}

impl LoopbackTransport {
    pub(crate) fn new(bridge: Weak<MessageBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, message: Message) -> Result<()> {
        let encoded = serde_json::to_string(&message).map_err(|e| ScopeError::Transport(e.to_string()))?;
        let decoded: Message =
            serde_json::from_str(&encoded).map_err(|e| ScopeError::Transport(e.to_string()))?;

        let bridge = self
            .bridge
            .upgrade()
            .ok_or_else(|| ScopeError::Transport("loopback bridge dropped".to_string()))?;
        bridge.deliver(decoded);
        Ok(())
    }
}

/// One end of an in-process duplex channel.
pub struct ChannelTransport {
    outbound: mpsc::Sender<Message>,
}

impl ChannelTransport {
    /// Two connected ends. Each end comes with the receiver for messages sent
    /// by the other end; pass it to [`MessageBridge::attach`].
    pub fn pair(capacity: usize) -> ((Self, mpsc::Receiver<Message>), (Self, mpsc::Receiver<Message>)) {
        let (to_right, right_inbound) = mpsc::channel(capacity);
        let (to_left, left_inbound) = mpsc::channel(capacity);
        (
            (Self { outbound: to_right }, left_inbound),
            (Self { outbound: to_left }, right_inbound),
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ScopeError::Transport("channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_pair_crosses() {
        let ((left, mut left_inbound), (right, mut right_inbound)) = ChannelTransport::pair(4);
        let message = Message::Request {
            id: "0".to_string(),
            kind: "ping".to_string(),
            data: json!(null),
        };

        left.send(message.clone()).await.unwrap();
        assert_eq!(right_inbound.recv().await.unwrap(), message);

        right.send(message.clone()).await.unwrap();
        assert_eq!(left_inbound.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_channel_closed() {
        let ((left, _), (_, right_inbound)) = ChannelTransport::pair(1);
        drop(right_inbound);

        let result = left
            .send(Message::Response {
                id: "0".to_string(),
                data: json!(null),
                error: None,
            })
            .await;
        assert!(matches!(result, Err(ScopeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_loopback_without_bridge() {
        let transport = LoopbackTransport::new(Weak::new());
        let result = transport
            .send(Message::Response {
                id: "0".to_string(),
                data: json!(null),
                error: None,
            })
            .await;
        assert!(matches!(result, Err(ScopeError::Transport(_))));
    }
}
