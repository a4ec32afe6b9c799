// Nodes - tasks, gateways and events of a process graph

//! # Nodes
//!
//! Every element the engine steps through is a [`Node`]. The BPMN class
//! taxonomy (activity, task, gateway, event and their many subclasses) is
//! flattened into one struct with a tagged [`NodeKind`]; kind-specific data
//! lives inside the variant.
//!
//! ## Rust Learning Notes:
//!
//! ### Tagged Variants Instead of Inheritance
//! A `match` on [`NodeKind`] is exhaustive, so adding a task kind forces
//! every dispatcher to handle it. The executor registry relies on this to
//! reject unknown kinds when it resolves an executor, not while a track runs.
//!
//! ### Shared Writers Behind `Arc<Mutex<..>>`
//! [`OutputSink`] wraps a boxed `dyn Write` in `Arc<Mutex<..>>`. Clones share
//! the writer, and the mutex is held while a whole line is emitted so
//! concurrent tracks never interleave inside a line.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::data::DataSet;
use super::event::{EventDefinition, EventKind};
use super::identity::Id;
use super::variable::Variable;

/// Task subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Store,
    Send,
    Receive,
    Output,
    Service,
    User,
    BusinessRule,
    Script,
    Call,
    ReceiveInstantiate,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Store => "store_task",
            TaskKind::Send => "send_task",
            TaskKind::Receive => "receive_task",
            TaskKind::Output => "output_task",
            TaskKind::Service => "service_task",
            TaskKind::User => "user_task",
            TaskKind::BusinessRule => "business_rule_task",
            TaskKind::Script => "script_task",
            TaskKind::Call => "call_activity",
            TaskKind::ReceiveInstantiate => "receive_instantiate_task",
        };
        write!(f, "{}", s)
    }
}

/// Writer shared by output tasks
///
/// The mutex is part of the descriptor: the engine never assumes the
/// underlying writer is safe for concurrent use.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        OutputSink {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Sink backed by an in-memory buffer; the returned handle reads it back
    pub fn memory() -> (Self, MemoryWriter) {
        let buffer = MemoryWriter::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Lock the writer for the duration of one emission
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Clonable in-memory writer
#[derive(Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Kind-specific task data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskDefinition {
    /// Declare variables in the instance store
    Store { vars: Vec<Variable> },
    /// Write `<name> = <value>` lines for the listed variables
    Output {
        vars: Vec<String>,
        #[serde(skip)]
        sink: OutputSink,
    },
    /// Put a message on the bus; an empty queue means the instance default
    Send {
        message: String,
        #[serde(default)]
        queue: String,
    },
    /// Wait for a message from the bus
    Receive {
        message: String,
        #[serde(default)]
        queue: String,
    },
    /// Receive task that may instantiate a process
    ReceiveInstantiate {
        message: String,
        #[serde(default)]
        queue: String,
    },
    /// Wait for an external completion
    User,
    Service,
    BusinessRule,
    Script,
    Call,
}

impl TaskDefinition {
    pub fn store(vars: Vec<Variable>) -> Self {
        TaskDefinition::Store { vars }
    }

    pub fn output<S: Into<String>>(vars: Vec<S>, sink: OutputSink) -> Self {
        TaskDefinition::Output {
            vars: vars.into_iter().map(Into::into).collect(),
            sink,
        }
    }

    pub fn send<M: Into<String>, Q: Into<String>>(message: M, queue: Q) -> Self {
        TaskDefinition::Send {
            message: message.into(),
            queue: queue.into(),
        }
    }

    pub fn receive<M: Into<String>, Q: Into<String>>(message: M, queue: Q) -> Self {
        TaskDefinition::Receive {
            message: message.into(),
            queue: queue.into(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskDefinition::Store { .. } => TaskKind::Store,
            TaskDefinition::Output { .. } => TaskKind::Output,
            TaskDefinition::Send { .. } => TaskKind::Send,
            TaskDefinition::Receive { .. } => TaskKind::Receive,
            TaskDefinition::ReceiveInstantiate { .. } => TaskKind::ReceiveInstantiate,
            TaskDefinition::User => TaskKind::User,
            TaskDefinition::Service => TaskKind::Service,
            TaskDefinition::BusinessRule => TaskKind::BusinessRule,
            TaskDefinition::Script => TaskKind::Script,
            TaskDefinition::Call => TaskKind::Call,
        }
    }

    /// Message name for send and receive tasks
    pub fn message_name(&self) -> Option<&str> {
        match self {
            TaskDefinition::Send { message, .. }
            | TaskDefinition::Receive { message, .. }
            | TaskDefinition::ReceiveInstantiate { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Exclusive,
    Inclusive,
    Parallel,
    EventBased,
    Complex,
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatewayKind::Exclusive => "exclusive_gateway",
            GatewayKind::Inclusive => "inclusive_gateway",
            GatewayKind::Parallel => "parallel_gateway",
            GatewayKind::EventBased => "event_based_gateway",
            GatewayKind::Complex => "complex_gateway",
        };
        write!(f, "{}", s)
    }
}

/// Declared gateway direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayDirection {
    #[default]
    Unspecified,
    Converging,
    Diverging,
    Mixed,
}

/// What a node is
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task(TaskDefinition),
    Gateway {
        kind: GatewayKind,
        #[serde(default)]
        direction: GatewayDirection,
    },
    Event {
        kind: EventKind,
        #[serde(default)]
        definitions: Vec<EventDefinition>,
    },
}

/// A process graph node
///
/// `incoming` and `outgoing` list sequence flow ids in declaration order;
/// the process maintains them as flows are linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub process_id: Id,
    #[serde(default)]
    pub incoming: Vec<Id>,
    #[serde(default)]
    pub outgoing: Vec<Id>,
    #[serde(default)]
    pub default_flow: Option<Id>,
    #[serde(default)]
    pub data: DataSet,
}

impl Node {
    pub fn new<S: Into<String>>(name: S, kind: NodeKind) -> Self {
        Node {
            id: Id::new(),
            name: name.into(),
            kind,
            process_id: Id::EMPTY,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            default_flow: None,
            data: DataSet::default(),
        }
    }

    pub fn task<S: Into<String>>(name: S, def: TaskDefinition) -> Self {
        Self::new(name, NodeKind::Task(def))
    }

    pub fn gateway<S: Into<String>>(name: S, kind: GatewayKind, direction: GatewayDirection) -> Self {
        Self::new(name, NodeKind::Gateway { kind, direction })
    }

    pub fn event<S: Into<String>>(name: S, kind: EventKind) -> Self {
        Self::new(
            name,
            NodeKind::Event {
                kind,
                definitions: Vec::new(),
            },
        )
    }

    pub fn start_event<S: Into<String>>(name: S) -> Self {
        Self::event(name, EventKind::Start)
    }

    pub fn end_event<S: Into<String>>(name: S) -> Self {
        Self::event(name, EventKind::End)
    }

    /// Attach an event definition; no-op on non-event nodes
    pub fn with_definition(mut self, def: EventDefinition) -> Self {
        if let NodeKind::Event { definitions, .. } = &mut self.kind {
            definitions.push(def);
        }
        self
    }

    pub fn with_data(mut self, data: DataSet) -> Self {
        self.data = data;
        self
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self.kind, NodeKind::Gateway { .. })
    }

    pub fn is_activity(&self) -> bool {
        matches!(self.kind, NodeKind::Task(_))
    }

    pub fn task_definition(&self) -> Option<&TaskDefinition> {
        match &self.kind {
            NodeKind::Task(def) => Some(def),
            _ => None,
        }
    }

    pub fn event_definitions(&self) -> &[EventDefinition] {
        match &self.kind {
            NodeKind::Event { definitions, .. } => definitions,
            _ => &[],
        }
    }

    /// Coarse element kind: `activity`, `gateway` or `event`
    pub fn element_kind(&self) -> &'static str {
        match self.kind {
            NodeKind::Task(_) => "activity",
            NodeKind::Gateway { .. } => "gateway",
            NodeKind::Event { .. } => "event",
        }
    }

    /// Fine-grained kind name used in logs and lifecycle payloads
    pub fn kind_name(&self) -> String {
        match &self.kind {
            NodeKind::Task(def) => def.kind().to_string(),
            NodeKind::Gateway { kind, .. } => kind.to_string(),
            NodeKind::Event { kind, .. } => kind.to_string(),
        }
    }

    /// Gateway direction with `Unspecified` resolved from the flow counts
    ///
    /// One incoming flow (or none) makes a diverging gateway, one outgoing
    /// flow with several incoming makes a converging one, several of both
    /// make a mixed gateway. Returns `None` for non-gateways.
    pub fn gateway_direction(&self) -> Option<GatewayDirection> {
        let NodeKind::Gateway { direction, .. } = self.kind else {
            return None;
        };
        if direction != GatewayDirection::Unspecified {
            return Some(direction);
        }
        let (ins, outs) = (self.incoming.len(), self.outgoing.len());
        Some(match (ins > 1, outs > 1) {
            (true, true) => GatewayDirection::Mixed,
            (true, false) => GatewayDirection::Converging,
            _ => GatewayDirection::Diverging,
        })
    }

    /// True for gateways that synchronize arriving tracks
    pub fn is_converging_gateway(&self) -> bool {
        matches!(
            self.gateway_direction(),
            Some(GatewayDirection::Converging | GatewayDirection::Mixed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_resolution() {
        let mut gw = Node::gateway("g", GatewayKind::Exclusive, GatewayDirection::Unspecified);
        gw.incoming = vec![Id::new()];
        gw.outgoing = vec![Id::new(), Id::new()];
        assert_eq!(gw.gateway_direction(), Some(GatewayDirection::Diverging));

        gw.incoming.push(Id::new());
        assert_eq!(gw.gateway_direction(), Some(GatewayDirection::Mixed));
        assert!(gw.is_converging_gateway());

        gw.outgoing.pop();
        assert_eq!(gw.gateway_direction(), Some(GatewayDirection::Converging));

        let task = Node::task("t", TaskDefinition::User);
        assert_eq!(task.gateway_direction(), None);
    }

    #[test]
    fn test_kind_names() {
        let store = Node::task("s", TaskDefinition::store(vec![]));
        assert_eq!(store.kind_name(), "store_task");
        assert_eq!(store.element_kind(), "activity");
        let end = Node::end_event("done");
        assert_eq!(end.kind_name(), "end_event");
        let gw = Node::gateway("g", GatewayKind::Parallel, GatewayDirection::Converging);
        assert_eq!(gw.kind_name(), "parallel_gateway");
    }

    #[test]
    fn test_memory_sink_shares_buffer() {
        let (sink, buffer) = OutputSink::memory();
        let copy = sink.clone();
        writeln!(sink.lock(), "a = 1").unwrap();
        writeln!(copy.lock(), "b = 2").unwrap();
        assert_eq!(buffer.contents(), "a = 1\nb = 2\n");
    }

    #[test]
    fn test_task_json_round_trip() {
        let node = Node::task("send", TaskDefinition::send("letter", "Q"));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"]["task"]["task"], "send");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_definition().and_then(|d| d.message_name()), Some("letter"));
    }
}
