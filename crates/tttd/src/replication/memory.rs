//! In-process broker for single-process deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::warn;

use super::broker::{Broker, BrokerError};

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 256;

/// A process-local topic bus.
///
/// Clones share the same topics, so several servers in one process can
/// replicate through one `InMemoryBroker`. `set_available(false)` fails
/// every publish and subscribe and ends live subscriptions, the way a
/// dropped broker connection would.
#[derive(Clone)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    available: Arc<watch::Sender<bool>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(watch::Sender::new(true)),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.send_replace(available);
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::Unavailable("in-memory broker offline".to_string()));
        }
        Ok(())
    }

    async fn topic(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        self.check_available()?;
        // No subscribers is not an error; the message is simply dropped.
        let _ = self.topic(topic).await.send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>, BrokerError> {
        self.check_available()?;

        let mut source = self.topic(topic).await.subscribe();
        let mut availability = self.available.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = source.recv() => match received {
                        Ok(payload) => {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "In-memory subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = availability.wait_for(|up| !*up) => break,
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
