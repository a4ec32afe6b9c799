// Node executors and the registry that resolves them

//! # Node Executors
//!
//! Every node kind runs through a [`NodeExecutor`]. A track drives one
//! executor per step in a fixed order:
//!
//! 1. [`TokenHandler::take`] when the executor handles tokens
//! 2. [`DataLinker::check_in`] when the node declares data inputs/outputs
//! 3. [`NodeExecutor::prologue`]; a failure means the node never runs
//! 4. [`NodeExecutor::exec`], returning the flows to follow
//! 5. [`NodeExecutor::epilogue`] after a successful `exec`
//! 6. [`DataLinker::check_out`]
//! 7. [`TokenHandler::return_tokens`], one token per flow; executors
//!    without a handler get the carried token split instead
//!
//! [`resolve`] is the registry: a total `match` over
//! [`NodeKind`](crate::models::NodeKind). Node kinds without an executor
//! fail here, when the executor is looked up, not halfway through `exec`.
//!
//! ## Rust Learning Notes:
//!
//! ### Optional Capabilities as `Option<&dyn Trait>`
//! Rust has no runtime interface checks like "does this object also
//! implement X". Executors instead expose optional capabilities through
//! methods returning `Option<&dyn TokenHandler>` or `Option<&dyn DataLinker>`,
//! defaulting to `None`.
//!
//! ### Default Trait Methods
//! `prologue` and `epilogue` have default bodies, so simple executors only
//! write `exec`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::env::ExecEnv;
use crate::models::{DataSet, GatewayKind, Id, Node, NodeKind, TaskDefinition, Token};
use crate::{Result, ThresherError};

pub mod event;
pub mod gateway;
pub mod messaging;
pub mod tasks;
pub mod user;

pub use event::EventExecutor;
pub use gateway::GatewayExecutor;
pub use messaging::{ReceiveExecutor, SendExecutor};
pub use tasks::{OutputExecutor, PassThroughExecutor, StoreExecutor};
pub use user::{UserTaskExecutor, UserTasks};

/// How a step finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Follow these sequence flows; empty ends the path
    Advance(Vec<Id>),
    /// The track was absorbed by a converging gateway
    Merged,
}

impl Completion {
    pub fn flows(&self) -> &[Id] {
        match self {
            Completion::Advance(flows) => flows,
            Completion::Merged => &[],
        }
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Checks before `exec`; an error is fatal for the track
    async fn prologue(&self, _ctx: &CancellationToken, _env: &dyn ExecEnv) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion>;

    /// Runs after a successful `exec`; an error is fatal for the track
    async fn epilogue(&self, _ctx: &CancellationToken, _env: &dyn ExecEnv) -> Result<()> {
        Ok(())
    }

    fn token_handler(&self) -> Option<&dyn TokenHandler> {
        None
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        None
    }
}

/// Executors that take over token bookkeeping from the track
pub trait TokenHandler: Send + Sync {
    /// Receive the carried token before `exec`
    fn take(&self, env: &dyn ExecEnv, token: &mut Token) -> Result<()>;

    /// Produce exactly one token per flow after `exec`
    fn return_tokens(&self, env: &dyn ExecEnv, token: &mut Token, flows: &[Id]) -> Result<Vec<Token>>;
}

/// Checks that declared data inputs and outputs line up with the store
pub trait DataLinker: Send + Sync {
    /// Every input exists and reads as its declared type
    fn check_in(&self, env: &dyn ExecEnv) -> Result<()>;

    /// Every output exists with exactly its declared type
    fn check_out(&self, env: &dyn ExecEnv) -> Result<()>;
}

impl DataLinker for DataSet {
    fn check_in(&self, env: &dyn ExecEnv) -> Result<()> {
        let store = env.variable_store();
        for input in &self.inputs {
            store.get_as(&input.name, input.var_type)?;
        }
        Ok(())
    }

    fn check_out(&self, env: &dyn ExecEnv) -> Result<()> {
        let store = env.variable_store();
        for output in &self.outputs {
            let var = store.get(&output.name)?;
            if var.var_type() != output.var_type {
                return Err(ThresherError::TypeMismatch {
                    name: output.name.clone(),
                    expected: output.var_type.to_string(),
                    actual: var.var_type().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Data linker of a node, if it declares any data
pub(crate) fn linker_for(node: &Node) -> Option<&dyn DataLinker> {
    if node.data.is_empty() {
        None
    } else {
        Some(&node.data)
    }
}

/// Resolve the executor for `node`
///
/// Converging gateways must be resolved through the instance's gatekeeper
/// so all arriving tracks share one executor; this function always builds
/// a fresh one.
pub fn resolve(node: &Node) -> Result<Arc<dyn NodeExecutor>> {
    let executor: Arc<dyn NodeExecutor> = match &node.kind {
        NodeKind::Task(def) => match def {
            TaskDefinition::Store { .. } => Arc::new(StoreExecutor::new(node.clone())),
            TaskDefinition::Output { .. } => Arc::new(OutputExecutor::new(node.clone())),
            TaskDefinition::Send { .. } => Arc::new(SendExecutor::new(node.clone())),
            TaskDefinition::Receive { .. } | TaskDefinition::ReceiveInstantiate { .. } => {
                Arc::new(ReceiveExecutor::new(node.clone()))
            }
            TaskDefinition::User => Arc::new(UserTaskExecutor::new(node.clone())),
            TaskDefinition::Service
            | TaskDefinition::BusinessRule
            | TaskDefinition::Script
            | TaskDefinition::Call => Arc::new(PassThroughExecutor::new(node.clone())),
        },
        NodeKind::Gateway {
            kind: GatewayKind::EventBased,
            ..
        } => {
            return Err(ThresherError::Dispatch {
                node: node.name.clone(),
                kind: node.kind_name(),
            })
        }
        NodeKind::Gateway { .. } => Arc::new(GatewayExecutor::new(node.clone())?),
        NodeKind::Event { .. } => Arc::new(EventExecutor::new(node.clone())),
    };
    Ok(executor)
}

/// Outgoing flows of an activity, the default flow first when present
pub(crate) fn default_first(node: &Node, mut flows: Vec<Id>) -> Vec<Id> {
    if let Some(default) = node.default_flow {
        if let Some(pos) = flows.iter().position(|f| *f == default) {
            let flow = flows.remove(pos);
            flows.insert(0, flow);
        }
    }
    flows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GatewayDirection, Variable};

    #[test]
    fn test_registry_covers_task_kinds() {
        let nodes = vec![
            Node::task("store", TaskDefinition::store(vec![Variable::int("x", 1)])),
            Node::task("service", TaskDefinition::Service),
            Node::task("user", TaskDefinition::User),
            Node::task("send", TaskDefinition::send("m", "")),
            Node::task("recv", TaskDefinition::receive("m", "")),
            Node::start_event("start"),
            Node::gateway("gw", GatewayKind::Exclusive, GatewayDirection::Diverging),
        ];
        for node in &nodes {
            assert!(resolve(node).is_ok(), "no executor for {}", node.name);
        }
    }

    #[test]
    fn test_event_based_gateway_fails_at_lookup() {
        let node = Node::gateway("wait", GatewayKind::EventBased, GatewayDirection::Diverging);
        assert!(matches!(resolve(&node), Err(ThresherError::Dispatch { .. })));
    }

    #[test]
    fn test_default_flow_moves_first() {
        let mut node = Node::task("t", TaskDefinition::Service);
        let (a, b, c) = (Id::new(), Id::new(), Id::new());
        node.default_flow = Some(c);
        assert_eq!(default_first(&node, vec![a, b, c]), vec![c, a, b]);
        node.default_flow = Some(Id::new());
        assert_eq!(default_first(&node, vec![a, b]), vec![a, b]);
    }
}
