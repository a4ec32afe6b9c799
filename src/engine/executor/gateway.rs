// Gateway executor - flow selection on the way out, synchronization on the way in

//! # Gateways
//!
//! A diverging gateway picks outgoing flows:
//! - exclusive: the first flow, in declaration order, whose condition holds
//!   (an unconditional flow holds), else the default flow
//! - inclusive / complex: every flow whose condition holds, else the default
//! - parallel: every outgoing flow
//!
//! A converging gateway is shared by every track reaching it (see
//! [`Gatekeeper`](crate::engine::gatekeeper::Gatekeeper)). Tracks register
//! as arrivals and the gateway opens once its open condition holds:
//! - exclusive: on the first arrival of a round, which passes at once;
//!   later arrivals of the same round finish as merged. A round is the set
//!   of tokens sharing an ancestor with the opener; a token descending from
//!   the opener (a loop back through the gateway) starts a new round
//! - parallel: one arrival for each declared incoming flow
//! - inclusive / complex: no live track outside the arrivals can still
//!   reach the gateway
//!
//! The arrival that opens the gateway continues, joining the tokens of the
//! other arrivals into its own. The others finish as merged.
//!
//! ## Rust Learning Notes:
//!
//! ### One-Shot Verdicts
//! Each waiting arrival holds the receiving half of a `oneshot` channel and
//! the gateway state holds the sender. The opening track sends on the
//! senders of the arrivals it absorbs; a waiter wakes exactly once.
//!
//! ### Never Await Under a `std::sync::Mutex`
//! The join state sits behind a synchronous mutex. Every critical section
//! finishes before the next `.await`, so the guard never crosses a
//! suspension point.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Completion, NodeExecutor, TokenHandler};
use crate::engine::env::ExecEnv;
use crate::models::{GatewayDirection, GatewayKind, Id, Node, NodeKind, Token};
use crate::{Result, ThresherError};

struct Arrival {
    track: Id,
    via: Option<Id>,
    token: Option<Token>,
    notify: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct JoinInner {
    /// Tokens handed over in `take`, waiting for their track to arrive
    tokens: HashMap<Id, Token>,
    arrivals: Vec<Arrival>,
    /// Tokens of absorbed arrivals, keyed by the opening track
    pending_join: HashMap<Id, Vec<Token>>,
    /// Tokens that opened an exclusive gateway, one per round
    openers: Vec<Token>,
}

impl JoinInner {
    fn is_waiting(&self, track: Id) -> bool {
        self.arrivals.iter().any(|a| a.track == track)
    }

    fn withdraw(&mut self, track: Id) {
        self.arrivals.retain(|a| a.track != track);
        self.tokens.remove(&track);
    }
}

/// Opener of the round `token` belongs to
///
/// `token` joins a round when it shares an ancestor with the opener and does
/// not descend from it.
fn open_round<'a>(openers: &'a [Token], token: &Token) -> Option<&'a Token> {
    openers.iter().find(|opener| {
        !token.prevs.contains(&opener.id) && !token.prevs.is_disjoint(&opener.prevs)
    })
}

enum Arrive {
    Opened,
    Wait(oneshot::Receiver<()>),
}

pub struct GatewayExecutor {
    node: Node,
    kind: GatewayKind,
    direction: GatewayDirection,
    join: Option<Mutex<JoinInner>>,
}

impl GatewayExecutor {
    pub fn new(node: Node) -> Result<Self> {
        let kind = match &node.kind {
            NodeKind::Gateway { kind, .. } => *kind,
            _ => {
                return Err(ThresherError::Internal(format!(
                    "node '{}' is not a gateway",
                    node.name
                )))
            }
        };
        if kind == GatewayKind::EventBased {
            return Err(ThresherError::Dispatch {
                node: node.name.clone(),
                kind: node.kind_name(),
            });
        }
        let direction = node.gateway_direction().unwrap_or(GatewayDirection::Diverging);
        let synchronizes = matches!(direction, GatewayDirection::Converging | GatewayDirection::Mixed);

        Ok(GatewayExecutor {
            node,
            kind,
            direction,
            join: synchronizes.then(|| Mutex::new(JoinInner::default())),
        })
    }

    pub fn kind(&self) -> GatewayKind {
        self.kind
    }

    pub fn direction(&self) -> GatewayDirection {
        self.direction
    }

    /// Number of tracks currently waiting at the gateway
    pub fn waiting(&self) -> usize {
        self.join.as_ref().map(|j| lock(j).arrivals.len()).unwrap_or(0)
    }

    /// Outgoing flows chosen by the diverging rule
    fn select_flows(&self, env: &dyn ExecEnv) -> Result<Vec<Id>> {
        let snapshot = env.snapshot();
        let store = env.variable_store();

        if self.kind == GatewayKind::Parallel {
            return Ok(self.node.outgoing.clone());
        }

        let mut selected = Vec::new();
        for id in &self.node.outgoing {
            if Some(*id) == self.node.default_flow {
                continue;
            }
            let flow = snapshot.flow(*id)?;
            let holds = match &flow.condition {
                Some(condition) => condition.evaluate(store)?,
                None => true,
            };
            if holds {
                selected.push(*id);
                if self.kind == GatewayKind::Exclusive {
                    break;
                }
            }
        }

        if selected.is_empty() {
            match self.node.default_flow {
                Some(default) => selected.push(default),
                None => return Err(ThresherError::NoFlowSelected(self.node.name.clone())),
            }
        }
        Ok(selected)
    }

    /// Flows leaving the gateway once the track may pass
    fn leave(&self, env: &dyn ExecEnv) -> Result<Vec<Id>> {
        match self.direction {
            GatewayDirection::Converging => Ok(self.node.outgoing.clone()),
            _ => self.select_flows(env),
        }
    }

    /// Register the arriving track and try to open
    fn arrive(&self, join: &Mutex<JoinInner>, env: &dyn ExecEnv) -> Arrive {
        let track = env.track_id();
        let mut inner = lock(join);
        let token = inner.tokens.remove(&track);
        let (tx, rx) = oneshot::channel();
        inner.arrivals.push(Arrival {
            track,
            via: env.arrived_via(),
            token,
            notify: Some(tx),
        });
        if self.try_open(&mut inner, env, track) {
            Arrive::Opened
        } else {
            Arrive::Wait(rx)
        }
    }

    /// Open the gateway for `track` when the open condition holds
    ///
    /// On success the absorbed arrivals are removed and notified, and their
    /// tokens are parked for `return_tokens` of the opening track.
    fn try_open(&self, inner: &mut JoinInner, env: &dyn ExecEnv, track: Id) -> bool {
        let round: Vec<Id> = match self.kind {
            GatewayKind::Parallel => {
                let own_via = inner
                    .arrivals
                    .iter()
                    .find(|a| a.track == track)
                    .and_then(|a| a.via);
                let mut round = Vec::new();
                for flow in &self.node.incoming {
                    if Some(*flow) == own_via {
                        continue;
                    }
                    match inner
                        .arrivals
                        .iter()
                        .find(|a| a.track != track && a.via == Some(*flow))
                    {
                        Some(arrival) => round.push(arrival.track),
                        None => return false,
                    }
                }
                round
            }
            _ => {
                let waiting: Vec<Id> = inner.arrivals.iter().map(|a| a.track).collect();
                let snapshot = env.snapshot();
                let gateway = self.node.id;
                let blocked = env.live_positions().into_iter().any(|(t, node)| {
                    !waiting.contains(&t) && (node == gateway || snapshot.can_reach(node, gateway))
                });
                if blocked {
                    return false;
                }
                waiting.into_iter().filter(|t| *t != track).collect()
            }
        };

        let mut absorbed = Vec::with_capacity(round.len());
        let mut arrivals = std::mem::take(&mut inner.arrivals);
        arrivals.retain_mut(|a| {
            if a.track == track {
                return false;
            }
            if round.contains(&a.track) {
                if let Some(token) = a.token.take() {
                    absorbed.push(token);
                }
                if let Some(notify) = a.notify.take() {
                    let _ = notify.send(());
                }
                return false;
            }
            true
        });
        inner.arrivals = arrivals;

        debug!(gateway = %self.node.name, track = %track.last(8), merged = round.len(), "gateway opened");
        inner.pending_join.insert(track, absorbed);
        true
    }
}

impl GatewayExecutor {
    /// Exclusive join: true when the arriving track opens its round
    fn pass_first(&self, join: &Mutex<JoinInner>, env: &dyn ExecEnv) -> bool {
        let track = env.track_id();
        let mut inner = lock(join);
        let Some(token) = inner.tokens.remove(&track) else {
            return true;
        };
        if let Some(opener) = open_round(&inner.openers, &token) {
            debug!(
                gateway = %self.node.name,
                track = %track.last(8),
                opener = %opener.id.last(8),
                "arrival merged into open round"
            );
            return false;
        }
        inner.openers.push(token);
        true
    }

    /// Retry opening after tracks moved; false while still waiting
    fn recheck(&self, join: &Mutex<JoinInner>, env: &dyn ExecEnv, track: Id) -> bool {
        let mut inner = lock(join);
        // an absorbed arrival gets its verdict through the oneshot instead
        inner.is_waiting(track) && self.try_open(&mut inner, env, track)
    }
}

fn lock(join: &Mutex<JoinInner>) -> MutexGuard<'_, JoinInner> {
    join.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl NodeExecutor for GatewayExecutor {
    async fn exec(&self, ctx: &CancellationToken, env: &dyn ExecEnv) -> Result<Completion> {
        let Some(join) = &self.join else {
            return Ok(Completion::Advance(self.leave(env)?));
        };

        if self.kind == GatewayKind::Exclusive {
            return if self.pass_first(join, env) {
                Ok(Completion::Advance(self.leave(env)?))
            } else {
                Ok(Completion::Merged)
            };
        }

        let track = env.track_id();
        // subscribe before arriving so no change in between is missed
        let mut changes = env.track_changes();
        let watch_tracks = self.kind != GatewayKind::Parallel;

        let mut verdict = match self.arrive(join, env) {
            Arrive::Opened => return Ok(Completion::Advance(self.leave(env)?)),
            Arrive::Wait(rx) => rx,
        };
        debug!(parent: env.logger(), gateway = %self.node.name, "waiting at gateway");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    lock(join).withdraw(track);
                    return Err(ThresherError::Cancelled);
                }
                received = &mut verdict => {
                    return match received {
                        Ok(()) => Ok(Completion::Merged),
                        Err(_) => Err(ThresherError::Internal(format!(
                            "gateway '{}' dropped a waiting arrival",
                            self.node.name
                        ))),
                    };
                }
                changed = changes.changed(), if watch_tracks => {
                    if changed.is_err() {
                        lock(join).withdraw(track);
                        return Err(ThresherError::Cancelled);
                    }
                    if self.recheck(join, env, track) {
                        return Ok(Completion::Advance(self.leave(env)?));
                    }
                }
            }
        }
    }

    fn token_handler(&self) -> Option<&dyn TokenHandler> {
        self.join.as_ref().map(|_| self as &dyn TokenHandler)
    }
}

impl TokenHandler for GatewayExecutor {
    fn take(&self, env: &dyn ExecEnv, token: &mut Token) -> Result<()> {
        if let Some(join) = &self.join {
            lock(join).tokens.insert(env.track_id(), token.clone());
        }
        Ok(())
    }

    fn return_tokens(&self, env: &dyn ExecEnv, token: &mut Token, flows: &[Id]) -> Result<Vec<Token>> {
        let mut others = match &self.join {
            Some(join) => lock(join).pending_join.remove(&env.track_id()).unwrap_or_default(),
            None => Vec::new(),
        };
        token.join(&mut others)?;
        token.split(flows.len())
    }
}
