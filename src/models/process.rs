// Process builder - assembles and validates a process graph

//! # Process Builder
//!
//! [`Process`] is the mutable side of the model. Nodes, flows, lanes,
//! messages and properties are added through methods that keep the graph
//! consistent on every insertion; [`Process::snapshot`] validates the whole
//! graph and freezes a copy for execution.
//!
//! ## Rust Learning Notes:
//!
//! ### Ids Instead of References
//! Flows store the ids of their endpoints and nodes store the ids of their
//! flows. Looking a node up by id costs a scan or a hash lookup, but the
//! borrow checker never has to reason about a cyclic graph of references.
//!
//! ### Early Return Validation
//! `validate` walks the graph and returns the first problem it finds with
//! `return Err(...)`, the same way a hand-written checker reads top to bottom.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::condition::FlowCondition;
use super::flow::SequenceFlow;
use super::identity::Id;
use super::lane::Lane;
use super::message::Message;
use super::node::{GatewayDirection, GatewayKind, Node, NodeKind, TaskDefinition};
use super::snapshot::Snapshot;
use super::variable::Variable;
use crate::{Result, ThresherError};

/// A process definition under construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: Id,
    pub name: String,
    nodes: Vec<Node>,
    flows: Vec<SequenceFlow>,
    lanes: Vec<Lane>,
    messages: Vec<Message>,
    properties: Vec<Variable>,
}

impl Process {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Process {
            id: Id::new(),
            name: name.into(),
            nodes: Vec::new(),
            flows: Vec::new(),
            lanes: Vec::new(),
            messages: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Add a node and take ownership of it
    ///
    /// Fails when the node already belongs to another process, when its name
    /// is taken, or when a store task declares a nameless variable. Flow
    /// lists on the node are reset; use [`Process::link`] to connect it.
    pub fn add_node(&mut self, mut node: Node) -> Result<Id> {
        if !node.process_id.is_empty() && node.process_id != self.id {
            return Err(ThresherError::structural(format!(
                "node '{}' already belongs to process {}",
                node.name, node.process_id
            )));
        }
        if node.name.trim().is_empty() {
            return Err(ThresherError::structural("node without a name"));
        }
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(ThresherError::structural(format!(
                "node {} added twice",
                node.id
            )));
        }
        if self.nodes.iter().any(|n| n.name == node.name) {
            return Err(ThresherError::DuplicateName {
                kind: "node",
                name: node.name,
            });
        }
        if let NodeKind::Task(TaskDefinition::Store { vars }) = &node.kind {
            let mut seen = HashSet::new();
            for v in vars {
                if v.name.is_empty() {
                    return Err(ThresherError::structural(format!(
                        "store task '{}' declares a variable without a name",
                        node.name
                    )));
                }
                if !seen.insert(v.name.as_str()) {
                    return Err(ThresherError::DuplicateName {
                        kind: "variable",
                        name: v.name.clone(),
                    });
                }
            }
        }

        node.process_id = self.id;
        node.incoming.clear();
        node.outgoing.clear();
        node.default_flow = None;
        let id = node.id;
        self.nodes.push(node);
        Ok(id)
    }

    /// Connect `source` to `target` with an unconditional flow
    pub fn link(&mut self, source: Id, target: Id) -> Result<Id> {
        self.add_flow(SequenceFlow::new(source, target))
    }

    /// Connect `source` to `target` with a guarded flow
    pub fn link_when(&mut self, source: Id, target: Id, condition: FlowCondition) -> Result<Id> {
        condition.validate()?;
        self.add_flow(SequenceFlow::new(source, target).with_condition(condition))
    }

    fn add_flow(&mut self, flow: SequenceFlow) -> Result<Id> {
        let source = self.position(flow.source)?;
        let target = self.position(flow.target)?;
        let id = flow.id;
        self.nodes[source].outgoing.push(id);
        self.nodes[target].incoming.push(id);
        self.flows.push(flow);
        Ok(id)
    }

    /// Mark one of the node's outgoing flows as its default
    pub fn set_default_flow(&mut self, node: Id, flow: Id) -> Result<()> {
        let idx = self.position(node)?;
        if !self.nodes[idx].outgoing.contains(&flow) {
            return Err(ThresherError::structural(format!(
                "flow {} does not leave node '{}'",
                flow, self.nodes[idx].name
            )));
        }
        self.nodes[idx].default_flow = Some(flow);
        Ok(())
    }

    /// Add a lane tree; every lane name in the process must be unique
    pub fn add_lane(&mut self, lane: Lane) -> Result<Id> {
        let mut names: HashSet<String> = self
            .lanes
            .iter()
            .flat_map(|l| l.walk())
            .map(|l| l.name.clone())
            .collect();
        for l in lane.walk() {
            if l.name.trim().is_empty() {
                return Err(ThresherError::structural("lane without a name"));
            }
            if !names.insert(l.name.clone()) {
                return Err(ThresherError::DuplicateName {
                    kind: "lane",
                    name: l.name.clone(),
                });
            }
            for n in &l.nodes {
                self.position(*n)?;
            }
        }
        let id = lane.id;
        self.lanes.push(lane);
        Ok(id)
    }

    /// Put a node into the named lane (searched through nested lanes)
    pub fn assign_lane(&mut self, lane_name: &str, node: Id) -> Result<()> {
        self.position(node)?;
        let lane = self
            .lanes
            .iter_mut()
            .find_map(|l| l.find_mut(lane_name))
            .ok_or_else(|| ThresherError::NotFound(format!("lane '{}'", lane_name)))?;
        if !lane.nodes.contains(&node) {
            lane.nodes.push(node);
        }
        Ok(())
    }

    pub fn add_message(&mut self, message: Message) -> Result<Id> {
        message.validate()?;
        if self.messages.iter().any(|m| m.name == message.name) {
            return Err(ThresherError::DuplicateName {
                kind: "message",
                name: message.name,
            });
        }
        let id = message.id;
        self.messages.push(message);
        Ok(id)
    }

    /// Declare a process-level variable, created in the store when an
    /// instance starts
    pub fn add_property(&mut self, var: Variable) -> Result<()> {
        if var.name.is_empty() {
            return Err(ThresherError::structural("property without a name"));
        }
        if self.properties.iter().any(|p| p.name == var.name) {
            return Err(ThresherError::DuplicateName {
                kind: "property",
                name: var.name,
            });
        }
        self.properties.push(var);
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn flows(&self) -> &[SequenceFlow] {
        &self.flows
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn properties(&self) -> &[Variable] {
        &self.properties
    }

    pub fn node(&self, id: Id) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn position(&self, id: Id) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| ThresherError::NotFound(format!("node {} in process '{}'", id, self.name)))
    }

    /// Check the graph before execution
    ///
    /// Rejects flows whose ends are missing or owned by another process,
    /// default flows that do not leave their node, event-based gateways, and
    /// gateways whose declared direction contradicts their flows: a
    /// converging gateway needs exactly one outgoing flow, a diverging one
    /// exactly one incoming flow.
    pub fn validate(&self) -> Result<()> {
        for flow in &self.flows {
            for end in [flow.source, flow.target] {
                let node = self.node(end).ok_or_else(|| {
                    ThresherError::structural(format!("flow {} references unknown node {}", flow.id, end))
                })?;
                if node.process_id != self.id {
                    return Err(ThresherError::structural(format!(
                        "flow {} crosses into another process at node '{}'",
                        flow.id, node.name
                    )));
                }
            }
        }

        for node in &self.nodes {
            if node.process_id != self.id {
                return Err(ThresherError::structural(format!(
                    "node '{}' is not owned by process '{}'",
                    node.name, self.name
                )));
            }
            if let Some(default) = node.default_flow {
                if !node.outgoing.contains(&default) {
                    return Err(ThresherError::structural(format!(
                        "default flow of '{}' does not leave it",
                        node.name
                    )));
                }
            }
            if let NodeKind::Gateway { kind, direction } = node.kind {
                if kind == GatewayKind::EventBased {
                    return Err(ThresherError::structural(format!(
                        "event-based gateway '{}' is not supported",
                        node.name
                    )));
                }
                match direction {
                    GatewayDirection::Converging if node.outgoing.len() != 1 => {
                        return Err(ThresherError::structural(format!(
                            "converging gateway '{}' has {} outgoing flows, expected 1",
                            node.name,
                            node.outgoing.len()
                        )));
                    }
                    GatewayDirection::Diverging if node.incoming.len() != 1 => {
                        return Err(ThresherError::structural(format!(
                            "diverging gateway '{}' has {} incoming flows, expected 1",
                            node.name,
                            node.incoming.len()
                        )));
                    }
                    _ => {}
                }
            }
            if let NodeKind::Task(def) = &node.kind {
                if let Some(name) = def.message_name() {
                    if !self.messages.iter().any(|m| m.name == name) {
                        return Err(ThresherError::structural(format!(
                            "task '{}' references undeclared message '{}'",
                            node.name, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate and freeze an immutable copy for execution
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.validate()?;
        Ok(Arc::new(Snapshot::new(self.clone())))
    }
}
