//! # Reference Platform Adapter
//!
//! This library shows how a host server plugs the desync engine into its
//! network stack, and drives synthetic sessions through it for testing and
//! demonstration.
//!
//! ## Architecture Overview
//!
//! ### Worker Lanes
//! Every connection gets its own tokio task and command channel. Frames for
//! one connection are handled strictly in the order they were queued while
//! connections proceed independently of one another.
//!
//! ### Tick Driver
//! A timer task advances the engine's clock at a fixed rate so tracked
//! objects expire on schedule, regardless of packet traffic.
//!
//! ## Module Organization
//!
//! ### Lane Module (`lane`)
//! Connection lifecycle, per-connection lanes and the tick driver.
//!
//! ### Sim Module (`sim`)
//! A small server world, simulated clients that predict their own
//! interactions, and stale updates that would desync them without the engine.
//!
//! ## Usage Example
//!
//! ```rust
//! use adapter::sim::{SimConfig, Simulation};
//! use engine::EngineConfig;
//!
//! # tokio_test::block_on(async {
//! let config = SimConfig { ticks: 20, ..SimConfig::default() };
//! let report = Simulation::new(config, EngineConfig::default())
//!     .unwrap()
//!     .run()
//!     .await
//!     .unwrap();
//! assert_eq!(report.final_desyncs, 0);
//! # });
//! ```

pub mod lane;
pub mod sim;

pub use lane::{LaneAdapter, LaneCommand, LaneError};
pub use sim::{SimConfig, SimError, SimReport, Simulation, World};
