// Start, intermediate and end events

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Completion, NodeExecutor, TokenHandler};
use crate::engine::env::ExecEnv;
use crate::models::{EventKind, Id, Node, NodeKind, Token};
use crate::Result;

/// Events pass the track through; an end event consumes its token
pub struct EventExecutor {
    node: Node,
    kind: EventKind,
}

impl EventExecutor {
    pub fn new(node: Node) -> Self {
        let kind = match &node.kind {
            NodeKind::Event { kind, .. } => *kind,
            _ => EventKind::IntermediateThrow,
        };
        EventExecutor { node, kind }
    }

    fn is_end(&self) -> bool {
        self.kind == EventKind::End
    }
}

#[async_trait]
impl NodeExecutor for EventExecutor {
    async fn exec(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        debug!(parent: env.logger(), event = %self.node.name, kind = %self.kind, "event reached");
        if self.is_end() {
            return Ok(Completion::Advance(Vec::new()));
        }
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn token_handler(&self) -> Option<&dyn TokenHandler> {
        if self.is_end() {
            Some(self)
        } else {
            None
        }
    }
}

impl TokenHandler for EventExecutor {
    fn take(&self, _env: &dyn ExecEnv, _token: &mut Token) -> Result<()> {
        Ok(())
    }

    fn return_tokens(&self, _env: &dyn ExecEnv, token: &mut Token, _flows: &[Id]) -> Result<Vec<Token>> {
        token.consume();
        Ok(Vec::new())
    }
}
