//! # Desync Engine
//!
//! This library sits inside a game server's network pipeline and keeps
//! clients from acting on block states they predicted locally but the server
//! never agreed to. Clients render the result of interacting with anvils,
//! doors, trapdoors and similar objects before the server confirms it; a
//! stale or repeated block update in that window lets the client's view
//! drift from the server's, which is the root of most duplication exploits.
//!
//! ## Core Responsibilities
//!
//! ### Prediction Tracking
//! Every outbound block change for a predictable kind arms its position for
//! that kind's TTL. At most one entry exists per position and connection; a
//! newer trigger replaces the older one.
//!
//! ### Reconciliation
//! While a position is armed, further block changes for it are checked:
//! - Redundant updates are cancelled
//! - Updates the host disagrees with are rewritten to the authoritative state,
//!   and the position is re-armed with it
//! - Updates the host cannot vouch for are cancelled rather than guessed at
//!
//! ### Confirmation
//! The engine brackets batches of updates with its own ping (or window-0
//! transaction) probes. When the client answers, everything sent before the
//! probe has been applied client-side, and the covered positions are
//! resolved. Clients answer in order, so one reply also settles every probe
//! sent before it. Replies to probes the engine never sent are left for the
//! host. Entries nobody confirms expire on the tick sweep.
//!
//! ## Architecture Design
//!
//! ### One Lane Per Connection
//! Each connection's packets go through its own lock in arrival order.
//! Connections never wait on each other; the connection table is only
//! locked briefly on register, unregister and tick.
//!
//! ### Never Break The Connection
//! Malformed frames, unsupported protocol versions, failing host callbacks
//! and even panics are absorbed at the tap. The result is at worst a
//! pass-through and a counted [`Anomaly`].
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Predictable kinds, their block-state ranges and TTLs, and the probe id
//! range. Validated once when the engine is built.
//!
//! ### Tracker Module (`tracker`)
//! Per-connection table of armed positions with TTL sweeping.
//!
//! ### Reconcile Module (`reconcile`)
//! Turns a packet envelope plus tracker state into a verdict.
//!
//! ### Tap Module (`tap`)
//! The [`PacketInterceptor`] adapters call for every frame.
//!
//! ### Engine Module (`engine`)
//! Connection registry, tick driver, and routing by connection id.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use engine::{Action, Engine, EngineConfig, PacketInterceptor};
//! use protocol::{Direction, ProtocolRegistry};
//!
//! let registry = Arc::new(ProtocolRegistry::standard());
//! let engine = Engine::new(registry, EngineConfig::default(), None).unwrap();
//! let tap = engine.register_connection(1, 763);
//!
//! // Frames the engine does not recognize are forwarded as they are.
//! let action = tap.intercept(Direction::Outbound, &[0x7F, 1, 2, 3]);
//! assert_eq!(action, Action::PassThrough);
//!
//! engine.tick(1);
//! engine.unregister_connection(1);
//! ```

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod query;
pub mod reconcile;
pub mod tap;
pub mod tracker;

pub use crate::config::{
    ConfigError, EngineConfig, IdRange, KindRule, ObjectKind, PredictionCatalogue, StateRange,
};
pub use crate::connection::{ConnectionId, ConnectionStats};
pub use crate::engine::{Engine, TickReport};
pub use crate::error::{Anomaly, EngineError};
pub use crate::query::{QueryError, StateQuery};
pub use crate::tap::{Action, ConnectionTap, PacketInterceptor};
pub use crate::tracker::{Tick, TrackedObject};
