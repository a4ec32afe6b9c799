// Track - one path of execution through a snapshot

//! # Tracks
//!
//! A track owns a list of steps. The last step is the node the track is at;
//! each tick executes it and appends the next one. Forked paths become new
//! tracks registered on the instance.
//!
//! ```text
//! ready ──tick──> executing ──┬──> ready     (next step appended)
//!                             ├──> ended     (no flow left to follow)
//!                             ├──> merged    (absorbed by a converging gateway)
//!                             └──> error     (node failure or cancellation)
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### `self: Arc<Self>` Receivers
//! `run` takes the track by `Arc` so the spawned task owns a handle while
//! the instance keeps its own in the track pool.
//!
//! ### Short Critical Sections
//! Status lives behind a `std::sync::RwLock`. Every guard is dropped before
//! the executor's futures are awaited, so no lock crosses an `.await`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info_span, Instrument, Span};

use super::env::TrackEnv;
use super::executor::{default_first, resolve, Completion};
use super::instance::{Instance, TrackReport};
use crate::models::{Id, Node, Snapshot, Token, TokenState};
use crate::{Result, ThresherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Ready,
    Executing,
    Ended,
    Error,
    Merged,
}

impl TrackState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackState::Ended | TrackState::Error | TrackState::Merged)
    }
}

impl std::fmt::Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackState::Ready => "ready",
            TrackState::Executing => "executing",
            TrackState::Ended => "ended",
            TrackState::Error => "error",
            TrackState::Merged => "merged",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Created,
    Started,
    Ended,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub node_id: Id,
    /// Flow the track followed into this node
    pub via: Option<Id>,
    pub token: Token,
    pub state: StepState,
}

#[derive(Debug)]
struct TrackStatus {
    state: TrackState,
    steps: Vec<Step>,
    error: Option<String>,
    cancelled: bool,
}

#[derive(Debug)]
pub struct Track {
    id: Id,
    instance_id: Id,
    seq: u64,
    status: RwLock<TrackStatus>,
}

impl Track {
    pub(crate) fn new(instance_id: Id, seq: u64, node_id: Id, via: Option<Id>, token: Token) -> Self {
        Track {
            id: Id::new(),
            instance_id,
            seq,
            status: RwLock::new(TrackStatus {
                state: TrackState::Ready,
                steps: vec![Step {
                    node_id,
                    via,
                    token,
                    state: StepState::Created,
                }],
                error: None,
                cancelled: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackStatus> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackStatus> {
        self.status.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn instance_id(&self) -> Id {
        self.instance_id
    }

    /// Creation order within the instance
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> TrackState {
        self.read().state
    }

    /// Node of the last step
    pub fn current_node(&self) -> Id {
        self.read().steps.last().map(|s| s.node_id).unwrap_or(Id::EMPTY)
    }

    /// State of the token the track carries
    pub fn token_state(&self) -> TokenState {
        self.read()
            .steps
            .last()
            .map(|s| s.token.state)
            .unwrap_or(TokenState::Inactive)
    }

    pub fn steps(&self) -> Vec<Step> {
        self.read().steps.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.read().cancelled
    }

    pub fn report(&self, snapshot: &Snapshot) -> TrackReport {
        let status = self.read();
        let node = status.steps.last().map(|s| s.node_id).unwrap_or(Id::EMPTY);
        TrackReport {
            id: self.id,
            seq: self.seq,
            state: status.state,
            node,
            node_name: snapshot.node(node).map(|n| n.name.clone()).unwrap_or_default(),
            token_state: status
                .steps
                .last()
                .map(|s| s.token.state)
                .unwrap_or(TokenState::Inactive),
            steps: status.steps.len(),
            error: status.error.clone(),
            cancelled: status.cancelled,
        }
    }

    /// Tick until the track reaches a terminal state
    pub(crate) async fn run(self: Arc<Self>, instance: Arc<Instance>) {
        let span = info_span!(
            "track",
            instance = %instance.id().last(8),
            track = %self.id.last(8)
        );
        let inner = span.clone();
        async move {
            loop {
                match contain_panic(self.tick(&instance, &inner)).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        self.fail(&instance, e);
                        break;
                    }
                }
            }
            debug!(state = %self.state(), "track finished");
            instance.notify_change();
        }
        .instrument(span)
        .await
    }

    /// Execute the current step; `Ok(false)` once the track is terminal
    async fn tick(&self, instance: &Arc<Instance>, span: &Span) -> Result<bool> {
        if instance.context().is_cancelled() {
            return Err(ThresherError::Cancelled);
        }

        let (node_id, via, mut token) = {
            let mut status = self.write();
            let Some(step) = status.steps.last_mut() else {
                status.state = TrackState::Ended;
                return Ok(false);
            };
            if step.state != StepState::Created {
                step.token.deactivate();
                status.state = TrackState::Ended;
                return Ok(false);
            }
            step.state = StepState::Started;
            let current = (step.node_id, step.via, step.token.clone());
            status.state = TrackState::Executing;
            current
        };
        instance.notify_change();

        let snapshot = instance.snapshot();
        let node = snapshot.node(node_id)?;
        let (completion, tokens) = self
            .execute(instance, node, via, &mut token, span)
            .await
            .map_err(|e| e.in_node(node))?;

        let flows = match completion {
            Completion::Merged => {
                token.deactivate();
                let mut status = self.write();
                if let Some(step) = status.steps.last_mut() {
                    step.token = token;
                    step.state = StepState::Ended;
                }
                status.state = TrackState::Merged;
                return Ok(false);
            }
            Completion::Advance(flows) => flows,
        };

        // forks first, so they happen after this step and before the next one
        let mut next = flows.into_iter().zip(tokens);
        let first = next.next();
        for (flow_id, child) in next {
            let flow = snapshot.flow(flow_id).map_err(|e| e.in_node(node))?;
            instance.add_track(flow.target, Some(flow_id), child);
        }
        let first = match first {
            Some((flow_id, child)) => {
                let flow = snapshot.flow(flow_id).map_err(|e| e.in_node(node))?;
                Some(Step {
                    node_id: flow.target,
                    via: Some(flow_id),
                    token: child,
                    state: StepState::Created,
                })
            }
            None => None,
        };

        let mut status = self.write();
        if let Some(step) = status.steps.last_mut() {
            token.deactivate();
            step.token = token;
            step.state = StepState::Ended;
        }
        let more = match first {
            Some(step) => {
                status.steps.push(step);
                status.state = TrackState::Ready;
                true
            }
            None => {
                status.state = TrackState::Ended;
                false
            }
        };
        drop(status);
        instance.notify_change();
        Ok(more)
    }

    /// Steps 3 through 8 of a tick: executor lookup to next tokens
    async fn execute(
        &self,
        instance: &Arc<Instance>,
        node: &Node,
        via: Option<Id>,
        token: &mut Token,
        span: &Span,
    ) -> Result<(Completion, Vec<Token>)> {
        let executor = if node.is_converging_gateway() {
            instance.get_gateway_executor(node)?
        } else {
            resolve(node)?
        };
        let env = TrackEnv::new(instance.clone(), self.id, via, span.clone());
        let ctx = instance.context();

        if let Some(handler) = executor.token_handler() {
            handler.take(&env, token)?;
        }
        if let Some(linker) = executor.data_linker() {
            linker.check_in(&env)?;
        }
        executor.prologue(ctx, &env).await?;
        let completion = executor.exec(ctx, &env).await?;
        if completion == Completion::Merged {
            return Ok((Completion::Merged, Vec::new()));
        }
        executor.epilogue(ctx, &env).await?;
        if let Some(linker) = executor.data_linker() {
            linker.check_out(&env)?;
        }

        let mut flows = completion.flows().to_vec();
        if node.is_activity() {
            flows = default_first(node, flows);
        }
        let tokens = match executor.token_handler() {
            Some(handler) => {
                let tokens = handler.return_tokens(&env, token, &flows)?;
                if tokens.len() != flows.len() {
                    return Err(ThresherError::Token(format!(
                        "{} tokens returned for {} flows",
                        tokens.len(),
                        flows.len()
                    )));
                }
                tokens
            }
            None => token.split(flows.len())?,
        };
        Ok((Completion::Advance(flows), tokens))
    }

    fn fail(&self, instance: &Instance, err: ThresherError) {
        let cancelled = err.is_cancellation();
        let node_name = {
            let mut status = self.write();
            let node = status.steps.last_mut().map(|step| {
                if step.state == StepState::Started {
                    step.state = StepState::Failed;
                }
                step.token.deactivate();
                step.node_id
            });
            status.state = TrackState::Error;
            status.error = Some(err.to_string());
            status.cancelled = cancelled;
            node.and_then(|id| instance.snapshot().node(id).ok())
                .map(|n| n.name.clone())
                .unwrap_or_default()
        };
        instance.notify_change();

        if cancelled {
            debug!(
                instance = %self.instance_id,
                track = %self.id,
                node = %node_name,
                "track cancelled"
            );
        } else {
            error!(
                instance = %self.instance_id,
                track = %self.id,
                node = %node_name,
                error = %err,
                "track failed"
            );
        }
    }
}

/// Run one tick, turning a panic inside it into an internal error
async fn contain_panic<F>(tick: F) -> Result<bool>
where
    F: Future<Output = Result<bool>>,
{
    match AssertUnwindSafe(tick).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(ThresherError::Internal(format!(
            "panic while executing step: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown cause"
    }
}
