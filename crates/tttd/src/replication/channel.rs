//! Replication channel: publishes local snapshots and merges incoming ones.
//!
//! ```text
//! GameActor ─outbox─▶ publisher ─publish─▶ Broker ─subscribe─▶ subscriber ─merge─▶ GameActor
//!                         │                                                            ▲
//!                         └─────────────── merge locally when degraded ────────────────┘
//! ```
//!
//! Every snapshot reaches local clients through a merge: normally via the
//! broker echo, or directly when the broker is unreachable.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ttt_protocol::ReplicationMessage;

use super::broker::{Broker, BrokerError};
use crate::game::{GameError, GameHandle, MergeOutcome};

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "game-moves";

/// Delay before the first resubscribe attempt.
pub const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on the resubscribe delay.
pub const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

const RESUBSCRIBE_MULTIPLIER: u32 = 2;

/// Next resubscribe delay after `current`.
pub fn next_delay(current: Duration) -> Duration {
    current
        .saturating_mul(RESUBSCRIBE_MULTIPLIER)
        .min(RESUBSCRIBE_MAX_DELAY)
}

/// A broker topic carrying `ReplicationMessage`s.
#[derive(Clone)]
pub struct ReplicationChannel {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
    subscribed: Arc<AtomicBool>,
}

impl ReplicationChannel {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: Arc::from(topic.into()),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// True while a subscription to the topic is live.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Serializes and publishes one snapshot.
    ///
    /// # Errors
    ///
    /// - `BrokerError::Encode` if the snapshot cannot be serialized
    /// - any error from the broker
    pub async fn publish(&self, message: &ReplicationMessage) -> Result<(), BrokerError> {
        let payload = message
            .to_json()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.broker.publish(&self.topic, payload).await
    }

    /// Starts the subscriber loop, calling `handler` for each snapshot.
    ///
    /// Payloads that do not parse are logged and dropped. A lost or failed
    /// subscription is retried with exponential backoff until `cancel`
    /// fires.
    pub fn on_receive<F, Fut>(&self, handler: F, cancel: CancellationToken) -> JoinHandle<()>
    where
        F: Fn(ReplicationMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let channel = self.clone();
        tokio::spawn(async move { channel.subscribe_loop(handler, cancel).await })
    }

    /// Wires this channel to the game: drains the publish outbox and merges
    /// every received snapshot.
    ///
    /// Returns the publisher and subscriber tasks.
    pub fn spawn(
        self,
        game: GameHandle,
        outbox: mpsc::UnboundedReceiver<ReplicationMessage>,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let merge_game = game.clone();
        let subscriber = self.on_receive(
            move |message| {
                let game = merge_game.clone();
                async move { merge_snapshot(&game, message, "broker").await }
            },
            cancel.clone(),
        );

        let publisher = tokio::spawn(self.publish_loop(game, outbox, cancel));

        (publisher, subscriber)
    }

    // ========================================================================
    // Loops
    // ========================================================================

    async fn publish_loop(
        self,
        game: GameHandle,
        mut outbox: mpsc::UnboundedReceiver<ReplicationMessage>,
        cancel: CancellationToken,
    ) {
        info!(topic = %self.topic, broker = self.broker.name(), "Replication publisher started");

        loop {
            tokio::select! {
                next = outbox.recv() => {
                    let Some(message) = next else {
                        debug!("Publish outbox closed");
                        break;
                    };
                    self.deliver(&game, message).await;
                }
                _ = cancel.cancelled() => break,
            }
        }

        info!("Replication publisher stopped");
    }

    /// Publishes one snapshot, merging it locally if no echo will come back.
    ///
    /// Without a live subscription the local merge happens first, so a slow
    /// broker never delays what local clients see.
    async fn deliver(&self, game: &GameHandle, message: ReplicationMessage) {
        let echo_expected = self.is_subscribed();
        if !echo_expected {
            merge_snapshot(game, message.clone(), "local").await;
        }

        let published = match self.publish(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    sequence = message.sequence,
                    error = %e,
                    "Publish failed, continuing locally"
                );
                false
            }
        };

        if echo_expected && (!published || !self.is_subscribed()) {
            merge_snapshot(game, message, "local").await;
        }
    }

    async fn subscribe_loop<F, Fut>(self, handler: F, cancel: CancellationToken)
    where
        F: Fn(ReplicationMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut delay = RESUBSCRIBE_INITIAL_DELAY;

        loop {
            match self.broker.subscribe(&self.topic).await {
                Ok(mut payloads) => {
                    info!(
                        topic = %self.topic,
                        broker = self.broker.name(),
                        "Replication subscribed"
                    );
                    self.subscribed.store(true, Ordering::SeqCst);
                    delay = RESUBSCRIBE_INITIAL_DELAY;

                    loop {
                        tokio::select! {
                            next = payloads.recv() => {
                                let Some(payload) = next else { break };
                                match ReplicationMessage::from_json(&payload) {
                                    Ok(message) => handler(message).await,
                                    Err(e) => {
                                        warn!(
                                            topic = %self.topic,
                                            error = %e,
                                            "Dropping malformed snapshot"
                                        );
                                    }
                                }
                            }
                            _ = cancel.cancelled() => {
                                self.subscribed.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }

                    self.subscribed.store(false, Ordering::SeqCst);
                    warn!(
                        topic = %self.topic,
                        error = %BrokerError::Closed,
                        "Replication subscription lost"
                    );
                }
                Err(e) => {
                    self.subscribed.store(false, Ordering::SeqCst);
                    warn!(
                        topic = %self.topic,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Replication subscribe failed"
                    );
                }
            }

            tokio::select! {
                _ = sleep(delay) => delay = next_delay(delay),
                _ = cancel.cancelled() => return,
            }
        }
    }
}

async fn merge_snapshot(game: &GameHandle, message: ReplicationMessage, source: &'static str) {
    let sequence = message.sequence;
    match game.merge(message).await {
        Ok(MergeOutcome::Applied) => {
            debug!(source, sequence, "Snapshot applied");
        }
        Ok(MergeOutcome::Stale { local, incoming }) => {
            debug!(source, local, incoming, "Stale snapshot ignored");
        }
        Err(GameError::ChannelClosed) => {
            warn!(source, "Game actor gone, snapshot dropped");
        }
        Err(e) => {
            warn!(source, error = %e, "Snapshot merge failed");
        }
    }
}
