// Lifecycle events emitted by instances

//! # Lifecycle Events
//!
//! Instances announce their progress on an [`EventBus`]:
//! - `INSTANCE_START` when `run` starts the initial tracks
//! - `NEW_TRACK` whenever a track is added (initial or forked)
//! - `INSTANCE_END` when the instance ended, with per-track results
//!
//! The bus is a `tokio::sync::broadcast` channel. Publishing never blocks
//! and never fails: with no subscriber the event is dropped, and a slow
//! subscriber sees `RecvError::Lagged` instead of stalling the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{Id, Node};

/// Default buffer of the broadcast channel
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    InstanceStart,
    InstanceEnd,
    NewTrack,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topic::InstanceStart => "INSTANCE_START",
            Topic::InstanceEnd => "INSTANCE_END",
            Topic::NewTrack => "NEW_TRACK",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub topic: Topic,
    pub instance_id: Id,
    /// Short JSON object; always carries `instance_id`
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast hub for lifecycle events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        trace!(topic = %event.topic, instance = %event.instance_id.last(8), "lifecycle event");
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, topic: Topic, instance_id: Id, mut payload: serde_json::Value) {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("instance_id".to_string(), serde_json::json!(instance_id.to_string()));
        }
        self.publish(LifecycleEvent {
            topic,
            instance_id,
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_instance_start(&self, instance_id: Id, snapshot_id: Id, tracks: usize) {
        self.emit(
            Topic::InstanceStart,
            instance_id,
            serde_json::json!({ "snapshot_id": snapshot_id.to_string(), "tracks": tracks }),
        );
    }

    /// `results` is the serialized per-track report list
    pub fn emit_instance_end(&self, instance_id: Id, cancelled: bool, results: serde_json::Value) {
        self.emit(
            Topic::InstanceEnd,
            instance_id,
            serde_json::json!({ "cancelled": cancelled, "tracks": results }),
        );
    }

    pub fn emit_new_track(&self, instance_id: Id, track_id: Id, node: &Node) {
        self.emit(
            Topic::NewTrack,
            instance_id,
            serde_json::json!({
                "track_id": track_id.to_string(),
                "node_name": node.name,
                "node_kind": node.kind_name(),
            }),
        );
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
