// User tasks - block until an outside caller completes them

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{linker_for, Completion, DataLinker, NodeExecutor};
use crate::engine::env::ExecEnv;
use crate::models::{Id, Node, Variable};
use crate::{Result, ThresherError};

/// Pending completions of user tasks, keyed by node id
#[derive(Debug, Default)]
pub struct UserTasks {
    completions: DashMap<Id, Vec<Variable>>,
    notify: Notify,
}

impl UserTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completion; a waiting task picks it up, a later one finds it
    pub fn complete(&self, node_id: Id, vars: Vec<Variable>) {
        self.completions.insert(node_id, vars);
        self.notify.notify_waiters();
    }

    fn take(&self, node_id: Id) -> Option<Vec<Variable>> {
        self.completions.remove(&node_id).map(|(_, vars)| vars)
    }
}

pub struct UserTaskExecutor {
    node: Node,
}

impl UserTaskExecutor {
    pub fn new(node: Node) -> Self {
        UserTaskExecutor { node }
    }
}

#[async_trait]
impl NodeExecutor for UserTaskExecutor {
    async fn exec(&self, ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        let tasks = env.user_tasks();
        let vars = loop {
            // register interest before checking so a completion in between is not lost
            let notified = tasks.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(vars) = tasks.take(self.node.id) {
                break vars;
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(ThresherError::Cancelled),
                _ = &mut notified => {}
            }
        };

        let store = env.variable_store();
        let count = vars.len();
        for var in vars {
            store.put(var)?;
        }
        info!(parent: env.logger(), node = %self.node.name, vars = count, "user task completed");
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        linker_for(&self.node)
    }
}
