//! Redis-backed broker using `PUBLISH` / `SUBSCRIBE`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::broker::{Broker, BrokerError};

/// Upper bound on connecting, publishing and subscribing (2 seconds)
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs one redis round trip, treating silence past `limit` as an outage.
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BrokerError::Unavailable(e.to_string())),
        Err(_) => Err(BrokerError::Unavailable(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Broker backed by a Redis server.
///
/// Publishing shares one multiplexed connection, opened on first use and
/// reopened after a failure. Each subscription owns a dedicated pub/sub
/// connection; when it drops, the returned receiver ends.
///
/// Every round trip is bounded by a timeout, so a server that accepts
/// connections but never answers reads as unavailable.
pub struct RedisBroker {
    client: redis::Client,
    url: String,
    publisher: Mutex<Option<MultiplexedConnection>>,
    command_timeout: Duration,
}

impl RedisBroker {
    /// Creates a broker for `url`. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        Self::with_timeout(url, COMMAND_TIMEOUT)
    }

    /// Creates a broker whose round trips give up after `command_timeout`.
    pub fn with_timeout(url: &str, command_timeout: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Unavailable(format!("invalid redis url {url}: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            publisher: Mutex::new(None),
            command_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn publish_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = bounded(
            self.command_timeout,
            "connect",
            self.client.get_multiplexed_async_connection(),
        )
        .await?;

        info!(url = %self.url, "Connected to redis for publishing");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.publish_connection().await?;

        let publish: redis::RedisFuture<'_, i64> = conn.publish(topic, payload);
        let result = bounded(self.command_timeout, "publish", publish).await;
        match result {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "Published to redis");
                Ok(())
            }
            Err(e) => {
                // Drop the connection so the next publish reconnects.
                *self.publisher.lock().await = None;
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, BrokerError> {
        let mut pubsub =
            bounded(self.command_timeout, "connect", self.client.get_async_pubsub()).await?;

        bounded(self.command_timeout, "subscribe", pubsub.subscribe(topic))
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        info!(url = %self.url, topic = %topic, "Subscribed to redis topic");

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    next = messages.next() => {
                        let Some(msg) = next else {
                            warn!(topic = %topic, "Redis subscription ended");
                            break;
                        };
                        match msg.get_payload::<String>() {
                            Ok(payload) => {
                                if tx.send(payload).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    topic = %topic,
                                    error = %e,
                                    "Dropping non-text redis payload"
                                );
                            }
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
