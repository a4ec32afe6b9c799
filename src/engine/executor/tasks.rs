// Store, output and pass-through task executors

use std::io::Write;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{linker_for, Completion, DataLinker, NodeExecutor};
use crate::engine::env::ExecEnv;
use crate::models::{Node, TaskDefinition};
use crate::{Result, ThresherError};

fn wrong_kind(node: &Node, expected: &str) -> ThresherError {
    ThresherError::Internal(format!(
        "node '{}' is a {}, not a {}",
        node.name,
        node.kind_name(),
        expected
    ))
}

/// Declares its variables in the instance store
pub struct StoreExecutor {
    node: Node,
}

impl StoreExecutor {
    pub fn new(node: Node) -> Self {
        StoreExecutor { node }
    }
}

#[async_trait]
impl NodeExecutor for StoreExecutor {
    async fn exec(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        let Some(TaskDefinition::Store { vars }) = self.node.task_definition() else {
            return Err(wrong_kind(&self.node, "store_task"));
        };
        let store = env.variable_store();
        for var in vars {
            store.new_var(var.clone())?;
            debug!(parent: env.logger(), node = %self.node.name, var = %var.name, "variable declared");
        }
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        linker_for(&self.node)
    }
}

/// Writes `<name> = <value>` lines to the task's sink
pub struct OutputExecutor {
    node: Node,
}

impl OutputExecutor {
    pub fn new(node: Node) -> Self {
        OutputExecutor { node }
    }
}

#[async_trait]
impl NodeExecutor for OutputExecutor {
    async fn exec(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        let Some(TaskDefinition::Output { vars, sink }) = self.node.task_definition() else {
            return Err(wrong_kind(&self.node, "output_task"));
        };
        let store = env.variable_store();
        for name in vars {
            let var = store.get(name)?;
            let line = format!("{} = {}\n", name, var.formatted());
            let mut writer = sink.lock();
            writer.write_all(line.as_bytes())?;
            writer.flush()?;
        }
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        linker_for(&self.node)
    }
}

/// Service, script, business-rule and call activities
///
/// These carry no behaviour of their own in the engine; they log and move on.
pub struct PassThroughExecutor {
    node: Node,
}

impl PassThroughExecutor {
    pub fn new(node: Node) -> Self {
        PassThroughExecutor { node }
    }
}

#[async_trait]
impl NodeExecutor for PassThroughExecutor {
    async fn exec(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        info!(parent: env.logger(), node = %self.node.name, kind = %self.node.kind_name(), "activity executed");
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        linker_for(&self.node)
    }
}
