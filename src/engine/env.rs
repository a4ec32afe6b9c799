// Execution environment - what a node executor may see and touch

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Span;

use super::bus::ServiceBus;
use super::executor::user::UserTasks;
use super::instance::Instance;
use super::store::VarStore;
use crate::models::{Id, Snapshot};

/// Capability bundle handed to every node executor
///
/// All accessors are read-only and thread-safe; the variable store
/// serializes its own mutation.
pub trait ExecEnv: Send + Sync {
    fn instance_id(&self) -> Id;

    /// Track executing the current step
    fn track_id(&self) -> Id;

    /// Sequence flow the track arrived through, if any
    fn arrived_via(&self) -> Option<Id>;

    /// Span of the executing track; log with `parent: env.logger()`
    fn logger(&self) -> &Span;

    fn snapshot(&self) -> &Snapshot;

    fn variable_store(&self) -> &VarStore;

    fn service_bus(&self) -> Arc<dyn ServiceBus>;

    /// `given` when non-empty, else the instance's default queue
    fn message_queue(&self, given: &str) -> String;

    /// How long one bus subscription may stay idle
    fn bus_wait(&self) -> Duration;

    fn user_tasks(&self) -> &UserTasks;

    /// `(track id, node id)` of every ready or executing track
    fn live_positions(&self) -> Vec<(Id, Id)>;

    /// Ticks whenever any track of the instance changes state or position
    fn track_changes(&self) -> watch::Receiver<u64>;
}

/// Environment of one step of one track
pub(crate) struct TrackEnv {
    instance: Arc<Instance>,
    track_id: Id,
    via: Option<Id>,
    span: Span,
}

impl TrackEnv {
    pub(crate) fn new(instance: Arc<Instance>, track_id: Id, via: Option<Id>, span: Span) -> Self {
        TrackEnv {
            instance,
            track_id,
            via,
            span,
        }
    }
}

impl ExecEnv for TrackEnv {
    fn instance_id(&self) -> Id {
        self.instance.id()
    }

    fn track_id(&self) -> Id {
        self.track_id
    }

    fn arrived_via(&self) -> Option<Id> {
        self.via
    }

    fn logger(&self) -> &Span {
        &self.span
    }

    fn snapshot(&self) -> &Snapshot {
        self.instance.snapshot()
    }

    fn variable_store(&self) -> &VarStore {
        self.instance.variable_store()
    }

    fn service_bus(&self) -> Arc<dyn ServiceBus> {
        self.instance.service_bus()
    }

    fn message_queue(&self, given: &str) -> String {
        if given.is_empty() {
            self.instance.message_queue().to_string()
        } else {
            given.to_string()
        }
    }

    fn bus_wait(&self) -> Duration {
        self.instance.bus_wait()
    }

    fn user_tasks(&self) -> &UserTasks {
        self.instance.user_tasks()
    }

    fn live_positions(&self) -> Vec<(Id, Id)> {
        self.instance.live_positions()
    }

    fn track_changes(&self) -> watch::Receiver<u64> {
        self.instance.track_changes()
    }
}
