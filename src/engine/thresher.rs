// Thresher - engine root: event processors and running instances

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::{InMemoryBus, ServiceBus};
use super::events::{EventBus, LifecycleEvent};
use super::instance::Instance;
use super::nats_bus::NatsBus;
use crate::config::{BusBackend, ThresherConfig};
use crate::models::{EventDefinition, Id, Snapshot};
use crate::{Result, ThresherError};

/// Handler for external events routed through [`Thresher::propagate_event`]
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn id(&self) -> Id;

    async fn process(&self, engine: &Thresher, definition: &EventDefinition) -> Result<()>;
}

struct Registration {
    processor: Arc<dyn EventProcessor>,
    definitions: HashMap<Id, EventDefinition>,
}

struct Running {
    cancel: CancellationToken,
    instance: Arc<Instance>,
}

/// Starts a new instance of its snapshot for every propagated start event
struct ProcessStarter {
    id: Id,
    snapshot: Arc<Snapshot>,
}

#[async_trait]
impl EventProcessor for ProcessStarter {
    fn id(&self) -> Id {
        self.id
    }

    async fn process(&self, engine: &Thresher, definition: &EventDefinition) -> Result<()> {
        let instance = engine.run_process(self.snapshot.clone(), vec![definition.clone()])?;
        info!(
            process = %self.snapshot.name(),
            instance = %instance.id(),
            "instance started by event"
        );
        Ok(())
    }
}

/// Engine root
///
/// No global state: everything an instance needs comes from the engine it
/// was started on, parameterized by a [`ServiceBus`] handle and the
/// configuration.
pub struct Thresher {
    registrations: DashMap<Id, Registration>,
    /// Process id to its unfinished instances
    instances: Arc<DashMap<Id, Vec<Running>>>,
    root: CancellationToken,
    events: EventBus,
    bus: Arc<dyn ServiceBus>,
    config: ThresherConfig,
}

impl Thresher {
    pub fn new(bus: Arc<dyn ServiceBus>, config: ThresherConfig) -> Self {
        Thresher {
            registrations: DashMap::new(),
            instances: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            events: EventBus::new(config.event_capacity),
            bus,
            config,
        }
    }

    /// Engine with the bus backend named in `config`
    pub fn from_config(config: ThresherConfig) -> Self {
        let bus: Arc<dyn ServiceBus> = match config.bus {
            BusBackend::Memory => Arc::new(InMemoryBus::new()),
            BusBackend::Nats => Arc::new(NatsBus::new(config.nats.clone())),
        };
        Self::new(bus, config)
    }

    pub fn config(&self) -> &ThresherConfig {
        &self.config
    }

    pub fn service_bus(&self) -> Arc<dyn ServiceBus> {
        self.bus.clone()
    }

    /// Lifecycle events of every instance started here
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Merge `definitions` under the processor's id
    pub fn register_events(
        &self,
        processor: Arc<dyn EventProcessor>,
        definitions: Vec<EventDefinition>,
    ) -> Result<()> {
        if definitions.is_empty() {
            return Err(ThresherError::structural(
                "no event definitions to register",
            ));
        }
        let count = definitions.len();
        let mut entry = self
            .registrations
            .entry(processor.id())
            .or_insert_with(|| Registration {
                processor: processor.clone(),
                definitions: HashMap::new(),
            });
        entry
            .definitions
            .extend(definitions.into_iter().map(|d| (d.id, d)));
        debug!(processor = %processor.id(), definitions = count, "events registered");
        Ok(())
    }

    /// Start `snapshot` whenever one of its start-event definitions is propagated
    ///
    /// Returns the id of the registered processor.
    pub fn register_process(&self, snapshot: Arc<Snapshot>) -> Result<Id> {
        let definitions: Vec<EventDefinition> =
            snapshot.start_definitions().into_iter().cloned().collect();
        if definitions.is_empty() {
            return Err(ThresherError::structural(format!(
                "process '{}' has no start event definitions",
                snapshot.name()
            )));
        }
        let starter = Arc::new(ProcessStarter {
            id: Id::new(),
            snapshot,
        });
        let id = starter.id;
        self.register_events(starter, definitions)?;
        Ok(id)
    }

    /// Route the event definition `definition_id` to every processor holding it
    ///
    /// Returns how many processors handled it.
    pub async fn propagate_event(&self, definition_id: Id) -> Result<usize> {
        // collect first; no map guard may live across an await
        let targets: Vec<(Arc<dyn EventProcessor>, EventDefinition)> = self
            .registrations
            .iter()
            .filter_map(|r| {
                r.definitions
                    .get(&definition_id)
                    .map(|d| (r.processor.clone(), d.clone()))
            })
            .collect();

        for (processor, definition) in &targets {
            processor.process(self, definition).await?;
        }
        Ok(targets.len())
    }

    /// Create, prepare and start an instance of `snapshot`
    ///
    /// Returns as soon as the instance is running in the background; follow
    /// it through [`Instance::wait`] or the lifecycle events. Must be called
    /// inside a Tokio runtime.
    pub fn run_process(
        &self,
        snapshot: Arc<Snapshot>,
        events: Vec<EventDefinition>,
    ) -> Result<Arc<Instance>> {
        let cancel = self.root.child_token();
        let instance = Instance::new(
            snapshot.clone(),
            self.bus.clone(),
            self.events.clone(),
            self.config.bus_wait(),
            cancel.clone(),
            events,
        );
        instance.prepare()?;

        let origin = snapshot.origin();
        self.instances.entry(origin).or_default().push(Running {
            cancel,
            instance: instance.clone(),
        });

        let registry = self.instances.clone();
        let runner = instance.clone();
        tokio::spawn(async move {
            match runner.run().await {
                Ok(()) => debug!(instance = %runner.id(), "instance finished"),
                Err(e) if e.is_cancellation() => debug!(instance = %runner.id(), "instance cancelled"),
                Err(e) => warn!(instance = %runner.id(), error = %e, "instance failed"),
            }
            if let Some(mut list) = registry.get_mut(&origin) {
                list.retain(|r| r.instance.id() != runner.id());
            }
            registry.remove_if(&origin, |_, list| list.is_empty());
        });

        Ok(instance)
    }

    /// Unfinished instances of a process
    pub fn instances(&self, process_id: Id) -> Vec<Arc<Instance>> {
        self.instances
            .get(&process_id)
            .map(|list| list.iter().map(|r| r.instance.clone()).collect())
            .unwrap_or_default()
    }

    /// Cancel every running instance of a process; returns how many
    pub fn stop_process(&self, process_id: Id) -> usize {
        let Some(list) = self.instances.get(&process_id) else {
            return 0;
        };
        for running in list.iter() {
            running.cancel.cancel();
        }
        info!(process = %process_id, instances = list.len(), "process stopped");
        list.len()
    }

    /// Cancel everything and wait for every instance to end
    pub async fn shutdown(&self) {
        self.root.cancel();
        let all: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .flat_map(|list| list.iter().map(|r| r.instance.clone()).collect::<Vec<_>>())
            .collect();
        for instance in all {
            instance.wait().await;
        }
        info!("thresher shut down");
    }
}
