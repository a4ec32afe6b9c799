// Core domain models for Thresher
// The immutable process model the engine executes

//! # Domain Models Module
//!
//! This module contains the process model Thresher executes. Everything here
//! is plain data: a [`Process`] is assembled through a small builder API,
//! validated, and frozen into a [`Snapshot`] that the engine shares read-only
//! between all tracks of an instance.
//!
//! ## Arena layout
//!
//! Nodes and flows reference each other by [`Id`], never by pointer. The
//! process stores nodes and flows keyed by id, so the cyclic references of a
//! BPMN graph (node to flow to node, gateway to gatekeeper) never become
//! ownership cycles.

// Opaque 128-bit identifiers
pub mod identity;

// Typed variables with coercing readers
pub mod variable;

// Item definitions and data input/output sets
pub mod data;

// Message definitions and the canonical JSON envelope
pub mod message;

// Flow conditions and the expression language behind them
pub mod condition;
pub mod expression;

// Sequence flows between nodes
pub mod flow;

// Event definitions carried by events and routed by the engine root
pub mod event;

// Tasks, gateways and events
pub mod node;

// Lanes grouping nodes under a label
pub mod lane;

// The process builder and validation
pub mod process;

// Immutable process snapshots
pub mod snapshot;

// Tokens with provenance
pub mod token;

pub use condition::{FlowCondition, VariableSource};
pub use data::{DataSet, ItemDefinition, ItemKind, Parameter};
pub use event::{EventDefinition, EventKind, EventTrigger};
pub use flow::SequenceFlow;
pub use identity::Id;
pub use lane::Lane;
pub use message::{Message, MessageDirection, MessageState, MessageVariable};
pub use node::{
    GatewayDirection, GatewayKind, MemoryWriter, Node, NodeKind, OutputSink, TaskDefinition, TaskKind,
};
pub use process::Process;
pub use snapshot::Snapshot;
pub use token::{Token, TokenState};
pub use variable::{Value, VarType, Variable, DEFAULT_PRECISION};
