// Thresher execution engine
// Runs process snapshots as instances of concurrent, token-carrying tracks

//! # Engine Module
//!
//! This module turns an immutable [`Snapshot`](crate::models::Snapshot) into
//! running work. The layering, leaves first:
//!
//! - **Variable store** (`store`): typed per-instance variables
//! - **Message bus** (`bus`, `nats_bus`): the out-of-process queue service
//!   used by send and receive tasks
//! - **Lifecycle events** (`events`): broadcast of instance start/end and
//!   new-track notifications
//! - **Execution environment** (`env`): the capability bundle handed to
//!   every node executor
//! - **Executors** (`executor`): one executor per node kind, resolved by a
//!   total dispatch over [`NodeKind`](crate::models::NodeKind)
//! - **Gatekeeper** (`gatekeeper`): one canonical executor per converging
//!   gateway so arriving tracks meet at one barrier
//! - **Track** (`track`): a single path of execution stepping node to node
//! - **Instance** (`instance`): owns the track pool and waits for it to drain
//! - **Thresher** (`thresher`): the engine root that starts instances and
//!   routes external events
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! `engine/` is a directory module: `mod.rs` declares the submodules and
//! re-exports the types callers need, so `use thresher::engine::Instance`
//! works without knowing which file defines it.
//!
//! ### Cancellation as a Value
//! Every blocking point selects on a `tokio_util::sync::CancellationToken`.
//! Cancelling the instance's token is the only way work is interrupted; no
//! task is ever aborted from outside.

/// Typed variable store shared by all tracks of an instance
pub mod store;

/// Message bus traits and the in-memory implementation
pub mod bus;

/// NATS JetStream message bus
pub mod nats_bus;

/// Lifecycle event broadcast
pub mod events;

/// Execution environment presented to node executors
pub mod env;

/// Node executors and the dispatch registry
pub mod executor;

/// Converging gateway synchronization
pub mod gatekeeper;

/// Per-path state machine
pub mod track;

/// Process instance: track pool, lifecycle, inspection
pub mod instance;

/// Engine root
pub mod thresher;

#[cfg(test)]
mod scenario_tests;

pub use bus::{Envelope, InMemoryBus, MessageServer, ServiceBus};
pub use env::ExecEnv;
pub use events::{EventBus, LifecycleEvent, Topic};
pub use executor::{Completion, DataLinker, NodeExecutor, TokenHandler, UserTasks};
pub use gatekeeper::Gatekeeper;
pub use instance::{Instance, InstanceState, TrackReport};
pub use nats_bus::NatsBus;
pub use store::VarStore;
pub use thresher::{EventProcessor, Thresher};
pub use track::{Step, StepState, Track, TrackState};
