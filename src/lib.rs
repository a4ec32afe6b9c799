// Thresher - Rust Edition
// A BPMN 2.0 process execution engine driven by tokens, tracks and gatekeepers

//! # Thresher Library
//!
//! Thresher executes BPMN 2.0 process models. A process is built once, frozen
//! into an immutable [`Snapshot`], and every run of that snapshot becomes an
//! [`Instance`] whose concurrent [`Track`]s carry [`Token`]s along sequence
//! flows until every path has reached a terminal state.
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`Process`] / [`Snapshot`]: the process graph (nodes, flows, lanes, messages)
//! - [`Node`]: tasks, gateways and events as one tagged type
//! - [`Variable`] / [`Value`]: typed process data with defined coercions
//! - [`Message`]: named payloads exchanged through the message bus
//! - [`Token`]: execution marker with provenance across splits and joins
//!
//! ### Execution Engine (`engine`)
//! - [`Thresher`]: engine root, registers event processors and starts instances
//! - [`Instance`]: owns the track pool, variable store and gatekeeper
//! - [`Track`]: one path of execution stepping through nodes
//! - [`Gatekeeper`]: one canonical executor per converging gateway
//! - [`NodeExecutor`]: the capability interface every node kind satisfies
//!
//! ### Message Bus
//! Send and receive tasks talk to an external [`MessageServer`]. An in-memory
//! implementation ([`InMemoryBus`]) and a NATS JetStream implementation
//! ([`NatsBus`]) are provided.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use thresher::{InMemoryBus, Node, Process, TaskDefinition, Thresher, ThresherConfig, Variable};
//!
//! # async fn demo() -> thresher::Result<()> {
//! let mut process = Process::new("hello");
//! let store = process.add_node(Node::task(
//!     "store x",
//!     TaskDefinition::store(vec![Variable::int("x", 10)]),
//! ))?;
//! let print = process.add_node(Node::task(
//!     "print x",
//!     TaskDefinition::output(vec!["x"], thresher::OutputSink::stdout()),
//! ))?;
//! process.link(store, print)?;
//!
//! let engine = Thresher::new(Arc::new(InMemoryBus::default()), ThresherConfig::default());
//! let instance = engine.run_process(process.snapshot()?, Vec::new())?;
//! instance.wait().await;
//! # Ok(())
//! # }
//! ```

// Immutable process model: nodes, flows, lanes, messages, variables, tokens
pub mod models;

// Execution engine: executors, tracks, gatekeepers, instances, thresher root
pub mod engine;

// Layered configuration (defaults, file, environment)
pub mod config;

pub use config::{BusBackend, NatsSettings, ThresherConfig};

pub use models::{
    DataSet, EventDefinition, EventKind, EventTrigger, FlowCondition, GatewayDirection,
    GatewayKind, Id, ItemDefinition, ItemKind, Lane, MemoryWriter, Message, MessageDirection,
    MessageState, MessageVariable, Node, NodeKind, OutputSink, Parameter, Process, SequenceFlow,
    Snapshot, TaskDefinition, TaskKind, Token, TokenState, Value, VarType, Variable,
    VariableSource,
};

pub use engine::{
    bus::{Envelope, InMemoryBus, MessageServer, ServiceBus},
    env::ExecEnv,
    events::{EventBus, LifecycleEvent, Topic},
    executor::{Completion, DataLinker, NodeExecutor, TokenHandler, UserTasks},
    gatekeeper::Gatekeeper,
    instance::{Instance, InstanceState, TrackReport},
    nats_bus::NatsBus,
    store::VarStore,
    thresher::{EventProcessor, Thresher},
    track::{Step, StepState, Track, TrackState},
};

use thiserror::Error;

/// Error type for every fallible Thresher operation
///
/// Variants follow the engine's error kinds: structural problems with the
/// model, executor dispatch failures, runtime operation failures inside a
/// node, cancellation, and programmer errors such as token misuse.
#[derive(Error, Debug)]
pub enum ThresherError {
    /// The process model is malformed
    #[error("Structural error: {0}")]
    Structural(String),

    /// A name that must be unique within its scope was used twice
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    /// A model element could not be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No executor exists for the node's kind
    #[error("No executor for node '{node}' of kind {kind}")]
    Dispatch { node: String, kind: String },

    /// A variable is missing from the store
    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    /// A variable exists but with another type
    #[error("Type mismatch for variable '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A value could not be coerced into the requested type
    #[error("Cannot convert {from} to {to}: {reason}")]
    Conversion {
        from: String,
        to: String,
        reason: String,
    },

    /// A message definition or envelope is unusable
    #[error("Message error: {0}")]
    Message(String),

    /// A diverging gateway found no flow to follow
    #[error("No outgoing flow selected at gateway '{0}'")]
    NoFlowSelected(String),

    /// A flow condition expression failed to parse or evaluate
    #[error("Expression '{source_text}': {reason}")]
    Expression { source_text: String, reason: String },

    /// Token operation on a token that is no longer alive
    #[error("Token error: {0}")]
    Token(String),

    /// Operation requested in the wrong lifecycle state
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// Failure inside a node, wrapped with the node's identity
    #[error("Node '{node_name}' ({node_id}) failed: {source}")]
    NodeFailed {
        node_name: String,
        node_id: Id,
        #[source]
        source: Box<ThresherError>,
    },

    /// The instance context was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// Message bus transport errors
    #[error("Bus error: {0}")]
    Bus(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Writer failures in output tasks
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThresherError {
    /// True when the error is (or wraps) a context cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            ThresherError::Cancelled => true,
            ThresherError::NodeFailed { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }

    /// Wrap an error with the node it happened in
    pub fn in_node(self, node: &Node) -> Self {
        ThresherError::NodeFailed {
            node_name: node.name.clone(),
            node_id: node.id,
            source: Box::new(self),
        }
    }

    pub(crate) fn structural<S: Into<String>>(msg: S) -> Self {
        ThresherError::Structural(msg.into())
    }
}

/// Type alias for Results that use our error type
pub type Result<T> = std::result::Result<T, ThresherError>;
