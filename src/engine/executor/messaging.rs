// Send and receive tasks - the bridge between an instance and the message bus

//! # Messaging Executors
//!
//! [`SendExecutor`] reads the message's variables from the store and puts
//! one envelope on the resolved queue. [`ReceiveExecutor`] subscribes to
//! the queue under the node's id and waits for an envelope carrying the
//! expected message name.
//!
//! The queue named on the task wins; an empty queue falls back to the
//! instance default `MQ<process-id>`.
//!
//! ## Rust Learning Notes:
//!
//! ### Racing a Stream Against Cancellation
//! `tokio::select!` polls the receive channel and the cancellation token
//! together; whichever completes first wins and the other future is
//! dropped. That is how a blocked receive observes a stopping instance.
//!
//! ### Detached Drain Task
//! After a match the remaining stream is moved into a spawned task that
//! reads it to the end, so the bus side never blocks on a full channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{linker_for, Completion, DataLinker, NodeExecutor};
use crate::engine::bus::Envelope;
use crate::engine::env::ExecEnv;
use crate::models::{Message, MessageState, MessageVariable, Node, TaskDefinition, Variable};
use crate::{Result, ThresherError};

/// Message name and queue of a messaging task
fn message_and_queue(node: &Node) -> Result<(&str, &str)> {
    match node.task_definition() {
        Some(TaskDefinition::Send { message, queue })
        | Some(TaskDefinition::Receive { message, queue })
        | Some(TaskDefinition::ReceiveInstantiate { message, queue }) => {
            Ok((message.as_str(), queue.as_str()))
        }
        _ => Err(ThresherError::Internal(format!(
            "node '{}' is not a messaging task",
            node.name
        ))),
    }
}

pub struct SendExecutor {
    node: Node,
}

impl SendExecutor {
    pub fn new(node: Node) -> Self {
        SendExecutor { node }
    }

    /// Current store values for the message's variables
    ///
    /// Values are read as the declared type and keep the declared
    /// precision. Missing optional variables are left out.
    fn collect_vars(&self, env: &dyn ExecEnv, msg: &Message) -> Result<Vec<MessageVariable>> {
        let store = env.variable_store();
        let mut vars = Vec::with_capacity(msg.vars.len());
        for decl in &msg.vars {
            let value = match store.get_as(decl.name(), decl.variable.var_type()) {
                Ok(value) => value,
                Err(ThresherError::VariableNotFound(_)) if decl.optional => continue,
                Err(e) => return Err(e),
            };
            let variable =
                Variable::new(decl.name(), value).with_precision(decl.variable.precision);
            vars.push(MessageVariable {
                optional: decl.optional,
                variable,
            });
        }
        Ok(vars)
    }
}

#[async_trait]
impl NodeExecutor for SendExecutor {
    async fn prologue(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<()> {
        let (name, _) = message_and_queue(&self.node)?;
        let msg = env.snapshot().message(name)?;
        if !msg.direction.is_outgoing() {
            return Err(ThresherError::Message(format!(
                "message '{}' is not outgoing",
                name
            )));
        }
        Ok(())
    }

    async fn exec(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        let (name, queue) = message_and_queue(&self.node)?;
        let definition = env.snapshot().message(name)?;
        let outgoing = definition.outgoing(self.collect_vars(env, definition)?);

        let queue = env.message_queue(queue);
        let server = env.service_bus().message_server().await?;
        server.put(env.instance_id(), &queue, &outgoing).await?;

        info!(parent: env.logger(), message = %name, queue = %queue, "message sent");
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        linker_for(&self.node)
    }
}

/// Receive and receive-instantiate tasks
pub struct ReceiveExecutor {
    node: Node,
}

impl ReceiveExecutor {
    pub fn new(node: Node) -> Self {
        ReceiveExecutor { node }
    }

    /// Read envelopes until one carries `name`
    ///
    /// Returns `None` when the stream closed first.
    async fn next_match(
        ctx: &CancellationToken,
        rx: &mut mpsc::Receiver<Envelope>,
        name: &str,
    ) -> Result<Option<Envelope>> {
        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => return Err(ThresherError::Cancelled),
                next = rx.recv() => next,
            };
            match next {
                Some(envelope) if envelope.name == name => return Ok(Some(envelope)),
                Some(envelope) => {
                    debug!(expected = %name, got = %envelope.name, "skipping envelope");
                }
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for ReceiveExecutor {
    async fn prologue(&self, _ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<()> {
        let (name, _) = message_and_queue(&self.node)?;
        let msg = env.snapshot().message(name)?;
        if !msg.direction.is_incoming() {
            return Err(ThresherError::Message(format!(
                "message '{}' is not incoming",
                name
            )));
        }
        if msg.state != MessageState::Created {
            return Err(ThresherError::Message(format!(
                "message '{}' is in state {:?}, expected Created",
                name, msg.state
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        let (name, queue) = message_and_queue(&self.node)?;
        let queue = env.message_queue(queue);
        let server = env.service_bus().message_server().await?;

        debug!(parent: env.logger(), message = %name, queue = %queue, "waiting for message");
        let envelope = loop {
            if ctx.is_cancelled() {
                return Err(ThresherError::Cancelled);
            }
            let mut rx = tokio::select! {
                _ = ctx.cancelled() => return Err(ThresherError::Cancelled),
                rx = server.get(self.node.id, &queue, env.bus_wait()) => rx?,
            };
            if let Some(envelope) = Self::next_match(ctx, &mut rx, name).await? {
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
                break envelope;
            }
            // idle stream closed; subscribe again
        };

        let msg = envelope.open()?;
        let store = env.variable_store();
        for mv in msg.vars.into_iter().filter(|v| !v.optional) {
            store.put(mv.variable)?;
        }

        info!(parent: env.logger(), message = %name, queue = %queue, "message received");
        Ok(Completion::Advance(self.node.outgoing.clone()))
    }

    fn data_linker(&self) -> Option<&dyn DataLinker> {
        linker_for(&self.node)
    }
}
