// Gatekeeper - one canonical executor per converging gateway

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::executor::GatewayExecutor;
use crate::models::{Id, Node};
use crate::Result;

/// Per-instance registry of converging gateway executors
///
/// The first track to reach a converging gateway inserts the executor it
/// resolved; every later track gets that same executor back, so all
/// arrivals meet in one join state.
#[derive(Default)]
pub struct Gatekeeper {
    entries: DashMap<Id, Arc<GatewayExecutor>>,
}

impl Gatekeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical executor of `gateway`, inserting it if absent
    pub fn executor_for(&self, gateway: &Node) -> Result<Arc<GatewayExecutor>> {
        if let Some(existing) = self.entries.get(&gateway.id) {
            return Ok(existing.value().clone());
        }
        let resolved = Arc::new(GatewayExecutor::new(gateway.clone())?);
        let entry = self.entries.entry(gateway.id).or_insert_with(|| {
            debug!(gateway = %gateway.name, "gatekeeper entry created");
            resolved
        });
        Ok(entry.value().clone())
    }

    /// Executor of `gateway` once a track has reached it
    pub fn get(&self, gateway: Id) -> Option<Arc<GatewayExecutor>> {
        self.entries.get(&gateway).map(|e| e.value().clone())
    }

    pub fn contains(&self, gateway: Id) -> bool {
        self.entries.contains_key(&gateway)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
