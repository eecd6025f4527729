//! tttd - Replicated tic-tac-toe server
//!
//! This crate provides the server side of the game:
//! - `game` - Game actor owning the single authoritative game state
//! - `replication` - Pub/sub replication between server instances
//! - `server` - TCP server, transports and per-connection session handling
//! - `config` - Defaults, environment and command-line configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tttd process                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  GameServer<T>  │────▶│         GameActor           │   │
//! │  │  (TcpListener)  │     │   (state + roles owner)     │   │
//! │  └────────┬────────┘     └──────┬───────────────▲──────┘   │
//! │           │                     │ outbox        │ merge    │
//! │           ▼                     ▼               │          │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │    ReplicationChannel       │   │
//! │  │  (per client)   │     │  (Redis / in-memory broker) │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every accepted move travels through the broker, even on a single
//! instance. Clients only ever see state that came back from the broker,
//! so all instances subscribed to a topic converge on the same board.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod game;
pub mod replication;
pub mod server;
