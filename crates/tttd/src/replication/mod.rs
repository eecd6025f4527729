//! Cross-process replication of the game through a publish/subscribe broker.
//!
//! - `Broker` - the publish/subscribe abstraction
//! - `RedisBroker` - production broker over Redis
//! - `InMemoryBroker` - process-local broker (single process, tests)
//! - `ReplicationChannel` - publishes local snapshots and merges remote ones
//!
//! Broker failures never stop play: the channel logs them and keeps the
//! local game running until the broker comes back.

mod broker;
mod channel;
mod memory;
mod redis_broker;

pub use broker::{Broker, BrokerError};
pub use channel::{
    next_delay, ReplicationChannel, DEFAULT_TOPIC, RESUBSCRIBE_INITIAL_DELAY, RESUBSCRIBE_MAX_DELAY,
};
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;
