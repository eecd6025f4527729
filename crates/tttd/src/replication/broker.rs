//! Publish/subscribe broker abstraction.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Broker failures. All of them are recoverable: the replication channel
/// logs them and falls back to local-only play.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("broker closed")]
    Closed,

    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// A topic-based publish/subscribe service.
///
/// Delivery is at-least-once to every subscriber of a topic, including the
/// process that published.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError>;

    /// Subscribes to `topic`.
    ///
    /// The receiver yields payloads until the subscription is lost, at which
    /// point it returns `None` and the caller may subscribe again.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>, BrokerError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
