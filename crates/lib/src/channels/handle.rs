//! Channel trait: the broker capability the lifecycle depends on.

use crate::channels::inbound::InboundMessage;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// A pub/sub connection delivering messages for subscribed topics.
///
/// After `subscribe`, every message on the topic is sent to `inbound_tx` at least once.
/// Reconnects after transport loss are the channel's job; callers never re-subscribe.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel id (e.g. "mqtt").
    fn id(&self) -> &str;
    /// Establish the initial session. Failure here is fatal to startup.
    async fn connect(&self) -> Result<(), ChannelError>;
    /// Subscribe and start delivering messages. Returns once the broker acknowledged the subscription.
    async fn subscribe(
        &self,
        topic: &str,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), ChannelError>;
    /// Unsubscribe and wait at most `wait` for the broker to acknowledge.
    async fn unsubscribe(&self, topic: &str, wait: Duration) -> Result<(), ChannelError>;
    /// Disconnect, waiting at most `grace` for an orderly close. Delivery stops and `inbound_tx` is dropped.
    async fn disconnect(&self, grace: Duration) -> Result<(), ChannelError>;
}
