// Instance - one run of a snapshot

//! # Instances
//!
//! An instance owns everything a run needs: the track pool, the variable
//! store, the gatekeeper and its default message queue. Its lifecycle:
//!
//! ```text
//! created ──prepare──> prepared ──run──> running ──┬──> ended
//!                                                  └──cancel──> stopping ──> ended
//! ```
//!
//! Track tasks are spawned on a `TaskTracker`, which plays the wait-group:
//! `run` returns only after every track task has exited, including tracks
//! forked while running.
//!
//! ## Rust Learning Notes:
//!
//! ### `tokio::sync::watch` as a State Cell
//! The lifecycle state lives in a `watch::Sender`. `send_if_modified`
//! gives an atomic compare-and-set, and `wait_for` lets callers await a
//! state without polling.
//!
//! ### Cancellation Tokens
//! Each instance gets a child of the engine's root `CancellationToken`.
//! Cancelling the root stops every instance; cancelling the child stops
//! only this one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::bus::ServiceBus;
use super::events::EventBus;
use super::executor::user::UserTasks;
use super::executor::NodeExecutor;
use super::gatekeeper::Gatekeeper;
use super::store::VarStore;
use super::track::{Track, TrackState};
use crate::models::{EventDefinition, Id, Node, Snapshot, TaskDefinition, Token, TokenState, Variable};
use crate::{Result, ThresherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Prepared,
    Running,
    Stopping,
    Ended,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Created => "created",
            InstanceState::Prepared => "prepared",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Ended => "ended",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackReport {
    pub id: Id,
    pub seq: u64,
    pub state: TrackState,
    /// Node of the last step
    pub node: Id,
    pub node_name: String,
    pub token_state: TokenState,
    pub steps: usize,
    pub error: Option<String>,
    pub cancelled: bool,
}

pub struct Instance {
    id: Id,
    snapshot: Arc<Snapshot>,
    queue: String,
    state: watch::Sender<InstanceState>,
    tracks: DashMap<Id, Arc<Track>>,
    next_seq: AtomicU64,
    gatekeeper: Gatekeeper,
    store: VarStore,
    events: EventBus,
    bus: Arc<dyn ServiceBus>,
    bus_wait: Duration,
    user_tasks: UserTasks,
    changes: watch::Sender<u64>,
    ctx: CancellationToken,
    tasks: TaskTracker,
    /// Serializes track registration against the start of `run`
    spawn_lock: Mutex<()>,
    triggers: Vec<EventDefinition>,
}

impl Instance {
    pub fn new(
        snapshot: Arc<Snapshot>,
        bus: Arc<dyn ServiceBus>,
        events: EventBus,
        bus_wait: Duration,
        ctx: CancellationToken,
        triggers: Vec<EventDefinition>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(InstanceState::Created);
        let (changes, _) = watch::channel(0u64);
        Arc::new(Instance {
            id: Id::new(),
            queue: snapshot.queue_name(),
            snapshot,
            state,
            tracks: DashMap::new(),
            next_seq: AtomicU64::new(0),
            gatekeeper: Gatekeeper::new(),
            store: VarStore::new(),
            events,
            bus,
            bus_wait,
            user_tasks: UserTasks::new(),
            changes,
            ctx,
            tasks: TaskTracker::new(),
            spawn_lock: Mutex::new(()),
            triggers,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    pub fn variable_store(&self) -> &VarStore {
        &self.store
    }

    pub fn service_bus(&self) -> Arc<dyn ServiceBus> {
        self.bus.clone()
    }

    /// Default queue, `MQ<process-id>`
    pub fn message_queue(&self) -> &str {
        &self.queue
    }

    pub fn bus_wait(&self) -> Duration {
        self.bus_wait
    }

    pub fn user_tasks(&self) -> &UserTasks {
        &self.user_tasks
    }

    /// Event definitions that started this instance
    pub fn triggers(&self) -> &[EventDefinition] {
        &self.triggers
    }

    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn gatekeeper(&self) -> &Gatekeeper {
        &self.gatekeeper
    }

    /// Compare-and-set on the lifecycle state
    fn transition(&self, from: InstanceState, to: InstanceState) -> Result<()> {
        let mut actual = from;
        let moved = self.state.send_if_modified(|state| {
            actual = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(instance = %self.id.last(8), from = %from, to = %to, "instance state");
            Ok(())
        } else {
            Err(ThresherError::InvalidState {
                expected: from.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// Declare process properties and create one track per entry node
    pub fn prepare(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if state != InstanceState::Created {
            return Err(ThresherError::InvalidState {
                expected: InstanceState::Created.to_string(),
                actual: state.to_string(),
            });
        }
        self.snapshot.validate()?;

        let entries: Vec<Id> = self.snapshot.entry_nodes().iter().map(|n| n.id).collect();
        if entries.is_empty() {
            return Err(ThresherError::structural(format!(
                "process '{}' has no node without incoming flows",
                self.snapshot.name()
            )));
        }

        for property in self.snapshot.properties() {
            self.store.new_var(property.clone())?;
        }
        for node in entries {
            self.add_track(node, None, Token::new(self.id));
        }

        self.transition(InstanceState::Created, InstanceState::Prepared)
    }

    /// Run every track to a terminal state
    ///
    /// Returns `Err(Cancelled)` when the context was cancelled; the
    /// instance still ends and still emits `INSTANCE_END`.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        {
            let _guard = self.spawn_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.transition(InstanceState::Prepared, InstanceState::Running)?;
            let mut initial: Vec<Arc<Track>> = self.tracks.iter().map(|t| t.value().clone()).collect();
            initial.sort_by_key(|t| t.seq());
            for track in initial {
                self.spawn(track);
            }
        }
        self.events
            .emit_instance_start(self.id, self.snapshot.id(), self.tracks.len());
        info!(instance = %self.id, process = %self.snapshot.name(), "instance started");
        self.tasks.close();

        // a cancel landing after the drain does not make a finished run cancelled
        let cancelled = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => true,
            _ = self.tasks.wait() => false,
        };
        if cancelled {
            // Running or Prepared never reach here; ignore a lost race with Ended
            let _ = self.transition(InstanceState::Running, InstanceState::Stopping);
            self.tasks.wait().await;
        }

        let reports = self.tracks();
        let results = serde_json::to_value(&reports).unwrap_or_default();
        self.events.emit_instance_end(self.id, cancelled, results);

        self.state.send_replace(InstanceState::Ended);
        info!(
            instance = %self.id,
            tracks = reports.len(),
            cancelled,
            "instance ended"
        );

        if cancelled {
            Err(ThresherError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn spawn(self: &Arc<Self>, track: Arc<Track>) {
        self.tasks.spawn(track.run(self.clone()));
    }

    /// Register a track at `node`; it starts at once if the instance runs
    pub fn add_track(self: &Arc<Self>, node: Id, via: Option<Id>, token: Token) -> Arc<Track> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let track = Arc::new(Track::new(self.id, seq, node, via, token));
        {
            let _guard = self.spawn_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.tracks.insert(track.id(), track.clone());
            if matches!(self.state(), InstanceState::Running | InstanceState::Stopping) {
                self.spawn(track.clone());
            }
        }
        if let Ok(node) = self.snapshot.node(node) {
            self.events.emit_new_track(self.id, track.id(), node);
        }
        self.notify_change();
        track
    }

    /// Canonical executor of a converging gateway
    pub fn get_gateway_executor(&self, gateway: &Node) -> Result<Arc<dyn NodeExecutor>> {
        let executor: Arc<dyn NodeExecutor> = self.gatekeeper.executor_for(gateway)?;
        Ok(executor)
    }

    /// Wake gateways waiting on track movement
    pub(crate) fn notify_change(&self) {
        self.changes.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    pub fn track_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// `(track, node)` of every ready or executing track
    pub fn live_positions(&self) -> Vec<(Id, Id)> {
        self.tracks
            .iter()
            .filter(|t| !t.state().is_terminal())
            .map(|t| (t.id(), t.current_node()))
            .collect()
    }

    /// Reports of every track in creation order
    pub fn tracks(&self) -> Vec<TrackReport> {
        let mut reports: Vec<TrackReport> = self
            .tracks
            .iter()
            .map(|t| t.report(&self.snapshot))
            .collect();
        reports.sort_by_key(|r| r.seq);
        reports
    }

    pub fn track(&self, id: Id) -> Option<Arc<Track>> {
        self.tracks.get(&id).map(|t| t.value().clone())
    }

    /// Tracks whose carried token is alive
    pub fn alive_tokens(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.token_state() == TokenState::Alive)
            .count()
    }

    /// Complete a waiting (or not yet reached) user task
    pub fn complete_user_task(&self, node_id: Id, vars: Vec<Variable>) -> Result<()> {
        let node = self.snapshot.node(node_id)?;
        if !matches!(node.task_definition(), Some(TaskDefinition::User)) {
            return Err(ThresherError::InvalidState {
                expected: "user_task".to_string(),
                actual: node.kind_name(),
            });
        }
        self.user_tasks.complete(node_id, vars);
        Ok(())
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Resolve once the instance has ended
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == InstanceState::Ended).await;
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("process", &self.snapshot.name())
            .field("state", &self.state())
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::InMemoryBus;
    use crate::models::{GatewayDirection, GatewayKind, Process, TaskDefinition, Variable};

    fn instance_of(process: &Process) -> Arc<Instance> {
        Instance::new(
            process.snapshot().unwrap(),
            Arc::new(InMemoryBus::new()),
            EventBus::default(),
            Duration::from_millis(200),
            CancellationToken::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_prepare_creates_a_track_per_entry_node() {
        let mut process = Process::new("two entries");
        process
            .add_node(Node::task("a", TaskDefinition::store(vec![Variable::int("a", 1)])))
            .unwrap();
        process
            .add_node(Node::task("b", TaskDefinition::store(vec![Variable::int("b", 1)])))
            .unwrap();
        process.add_property(Variable::string("owner", "ops")).unwrap();
        let instance = instance_of(&process);

        instance.prepare().unwrap();
        assert_eq!(instance.state(), InstanceState::Prepared);
        assert_eq!(instance.tracks().len(), 2);
        assert_eq!(instance.alive_tokens(), 2);
        assert_eq!(instance.variable_store().get("owner").unwrap().string_value(), "ops");
        assert!(matches!(instance.prepare(), Err(ThresherError::InvalidState { .. })));
    }

    #[test]
    fn test_failed_prepare_leaves_store_empty() {
        let mut process = Process::new("no entry");
        process
            .add_node(Node::gateway("gw", GatewayKind::Parallel, GatewayDirection::Unspecified))
            .unwrap();
        process.add_property(Variable::string("owner", "ops")).unwrap();
        let instance = instance_of(&process);

        assert!(matches!(instance.prepare(), Err(ThresherError::Structural(_))));
        assert!(instance.variable_store().is_empty());
        assert_eq!(instance.state(), InstanceState::Created);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_after_finish_keeps_result() {
        let mut process = Process::new("quick");
        process
            .add_node(Node::task("a", TaskDefinition::store(vec![Variable::int("a", 1)])))
            .unwrap();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let instance = Instance::new(
            process.snapshot().unwrap(),
            Arc::new(InMemoryBus::new()),
            events,
            Duration::from_millis(200),
            CancellationToken::new(),
            Vec::new(),
        );
        instance.prepare().unwrap();
        assert!(instance.run().await.is_ok());
        instance.cancel();

        assert_eq!(instance.state(), InstanceState::Ended);
        loop {
            let event = rx.recv().await.unwrap();
            if event.topic == crate::engine::events::Topic::InstanceEnd {
                assert_eq!(event.payload["cancelled"], false);
                break;
            }
        }
        assert_eq!(instance.tracks()[0].state, TrackState::Ended);
    }

    #[tokio::test]
    async fn test_run_requires_prepare() {
        let mut process = Process::new("p");
        process.add_node(Node::task("a", TaskDefinition::Service)).unwrap();
        let instance = instance_of(&process);
        assert!(matches!(instance.run().await, Err(ThresherError::InvalidState { .. })));
    }

    #[test]
    fn test_complete_user_task_checks_node_kind() {
        let mut process = Process::new("p");
        let service = process.add_node(Node::task("svc", TaskDefinition::Service)).unwrap();
        let instance = instance_of(&process);
        assert!(instance.complete_user_task(service, Vec::new()).is_err());
        assert!(instance.complete_user_task(Id::new(), Vec::new()).is_err());
    }
}
