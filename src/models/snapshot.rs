// Process snapshots - immutable copies instances execute against

use std::collections::{HashMap, HashSet};

use super::event::{EventDefinition, EventKind};
use super::flow::SequenceFlow;
use super::identity::Id;
use super::message::Message;
use super::node::{Node, NodeKind};
use super::process::Process;
use super::variable::Variable;
use crate::{Result, ThresherError};

/// Frozen copy of a process
///
/// A snapshot has its own id and remembers the process it was taken from
/// (`origin`). There is no mutating API; instances share it through an
/// `Arc` and read it concurrently without locking.
///
/// Alongside the copied graph it keeps hash indexes for node and flow
/// lookup and, for every gateway, the set of nodes from which that gateway
/// can be reached. Converging inclusive gateways use the latter to decide
/// whether more arrivals are still possible.
#[derive(Debug)]
pub struct Snapshot {
    id: Id,
    origin: Id,
    process: Process,
    nodes: HashMap<Id, usize>,
    names: HashMap<String, usize>,
    flows: HashMap<Id, usize>,
    upstream: HashMap<Id, HashSet<Id>>,
}

impl Snapshot {
    pub(crate) fn new(process: Process) -> Self {
        let nodes = process
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();
        let names = process
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let flows: HashMap<Id, usize> = process
            .flows()
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id, i))
            .collect();

        let mut upstream = HashMap::new();
        for gw in process.nodes().iter().filter(|n| n.is_gateway()) {
            // reverse walk along incoming flows
            let mut seen = HashSet::new();
            let mut stack: Vec<Id> = incoming_sources(&process, gw);
            while let Some(id) = stack.pop() {
                if seen.insert(id) {
                    if let Some(node) = process.node(id) {
                        stack.extend(incoming_sources(&process, node));
                    }
                }
            }
            upstream.insert(gw.id, seen);
        }

        Snapshot {
            id: Id::new(),
            origin: process.id,
            process,
            nodes,
            names,
            flows,
            upstream,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Id of the process the snapshot was taken from
    pub fn origin(&self) -> Id {
        self.origin
    }

    pub fn name(&self) -> &str {
        &self.process.name
    }

    /// Re-run structural validation on the frozen graph
    pub fn validate(&self) -> Result<()> {
        self.process.validate()
    }

    pub fn node(&self, id: Id) -> Result<&Node> {
        self.nodes
            .get(&id)
            .map(|&i| &self.process.nodes()[i])
            .ok_or_else(|| ThresherError::NotFound(format!("node {} in snapshot {}", id, self.id)))
    }

    pub fn node_by_name(&self, name: &str) -> Result<&Node> {
        self.names
            .get(name)
            .map(|&i| &self.process.nodes()[i])
            .ok_or_else(|| ThresherError::NotFound(format!("node '{}'", name)))
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        self.process.nodes()
    }

    pub fn flow(&self, id: Id) -> Result<&SequenceFlow> {
        self.flows
            .get(&id)
            .map(|&i| &self.process.flows()[i])
            .ok_or_else(|| ThresherError::NotFound(format!("sequence flow {}", id)))
    }

    pub fn message(&self, name: &str) -> Result<&Message> {
        self.process
            .messages()
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ThresherError::NotFound(format!("message '{}'", name)))
    }

    pub fn properties(&self) -> &[Variable] {
        self.process.properties()
    }

    pub fn lanes(&self) -> &[super::lane::Lane] {
        self.process.lanes()
    }

    /// Non-gateway nodes without incoming flows, in declaration order
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.process
            .nodes()
            .iter()
            .filter(|n| !n.is_gateway() && n.incoming.is_empty())
            .collect()
    }

    pub fn incoming(&self, node: &Node) -> Vec<&SequenceFlow> {
        node.incoming.iter().filter_map(|id| self.flow(*id).ok()).collect()
    }

    pub fn outgoing(&self, node: &Node) -> Vec<&SequenceFlow> {
        node.outgoing.iter().filter_map(|id| self.flow(*id).ok()).collect()
    }

    /// True when a path of sequence flows leads from `from` to gateway `to`
    ///
    /// Only gateways are indexed; any other target answers `false`.
    pub fn can_reach(&self, from: Id, to: Id) -> bool {
        self.upstream
            .get(&to)
            .map(|set| set.contains(&from))
            .unwrap_or(false)
    }

    /// Event definitions of start events, used to register the snapshot
    /// for instantiation by external events
    pub fn start_definitions(&self) -> Vec<&EventDefinition> {
        self.process
            .nodes()
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Event { kind: EventKind::Start, .. }))
            .flat_map(|n| n.event_definitions())
            .collect()
    }

    /// Default message queue: `MQ` followed by the origin process id
    pub fn queue_name(&self) -> String {
        format!("MQ{}", self.origin)
    }
}

fn incoming_sources(process: &Process, node: &Node) -> Vec<Id> {
    node.incoming
        .iter()
        .filter_map(|f| process.flows().iter().find(|flow| flow.id == *f))
        .map(|f| f.source)
        .collect()
}
