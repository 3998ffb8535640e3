//! The orchestrator owns one instance of every component and wires them
//! together. Nothing in SkyGrid is global; the daemon builds an
//! [`Orchestrator`] from its config and drives its lifecycle.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use sky_core::{BroadcastNotifier, Notification, SharedNotifier, Shutdown, SkyConfig};
use skygrid_link::{LinkFactory, SimulatedLinkFactory};
use skygrid_mission::MissionExecutor;
use skygrid_registry::{FleetRegistry, LinkMonitor};
use skygrid_scheduler::JobScheduler;
use skygrid_slots::{ResourcePool, link_address};
use skygrid_state::JobStore;
use skygrid_telemetry::TelemetryAggregator;

use crate::error::{ControlError, ControlResult};

/// Notifications buffered per subscriber before it starts lagging.
const NOTIFY_CAPACITY: usize = 1024;

pub struct Orchestrator {
    pub(crate) config: SkyConfig,
    pub(crate) store: JobStore,
    pub(crate) pool: Arc<Mutex<ResourcePool>>,
    pub(crate) registry: FleetRegistry,
    pub(crate) monitor: LinkMonitor,
    pub(crate) executor: MissionExecutor,
    pub(crate) scheduler: JobScheduler,
    pub(crate) telemetry: TelemetryAggregator,
    notifier: BroadcastNotifier,
    links: Arc<dyn LinkFactory>,
    shutdown: Shutdown,
    /// Dispatch and overdue-scan loops, empty until started.
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component from `config`, with vehicle links created by
    /// `links`.
    pub fn new(config: SkyConfig, store: JobStore, links: Arc<dyn LinkFactory>) -> Self {
        let notifier = BroadcastNotifier::new(NOTIFY_CAPACITY);
        let sink: SharedNotifier = Arc::new(notifier.clone());

        let pool = if config.slots.probe {
            ResourcePool::new()
        } else {
            ResourcePool::with_probe(Box::new(|_| true))
        };

        let registry =
            FleetRegistry::new(config.fleet.min_dispatch_battery).with_notifier(sink.clone());
        let monitor = LinkMonitor::new(registry.clone());
        let executor = MissionExecutor::new(store.clone(), registry.clone(), config.mission.clone())
            .with_notifier(sink.clone());
        let scheduler = JobScheduler::new(
            store.clone(),
            registry.clone(),
            executor.clone(),
            config.scheduler.clone(),
        )
        .with_notifier(sink.clone());
        let telemetry =
            TelemetryAggregator::new(registry.clone(), executor.clone(), config.telemetry.clone())
                .with_notifier(sink);

        Self {
            config,
            store,
            pool: Arc::new(Mutex::new(pool)),
            registry,
            monitor,
            executor,
            scheduler,
            telemetry,
            notifier,
            links,
            shutdown: Shutdown::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Build with the link implementation named in `[link] kind`.
    pub fn from_config(config: SkyConfig, store: JobStore) -> ControlResult<Self> {
        let links: Arc<dyn LinkFactory> = match config.link.kind.as_str() {
            "simulated" => Arc::new(SimulatedLinkFactory {
                time_scale: config.link.time_scale,
                telemetry_interval: config.fleet.telemetry_interval(),
            }),
            other => return Err(ControlError::UnknownLinkKind(other.to_string())),
        };
        Ok(Self::new(config, store, links))
    }

    /// Bring the fleet up: open the slot pool, register every unit with a
    /// slot and a link, connect them, then start dispatch and telemetry.
    ///
    /// A unit that gets no slot or fails to connect stays registered and
    /// is reported; it does not stop the others.
    pub async fn start(&self) -> ControlResult<()> {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return Err(ControlError::AlreadyStarted);
        }

        let slots = self
            .pool
            .lock()
            .await
            .initialize(self.config.slots.base, self.config.slots.count);
        info!(slots, base = self.config.slots.base, "slot pool initialized");

        let units = self.config.fleet.resolved_units();
        for unit in &units {
            let home = self.config.fleet.home_for(unit);
            let name = unit.name.as_deref().unwrap_or(&unit.id);
            self.registry.register(&unit.id, name, home).await?;
            self.registry
                .attach_link(&unit.id, self.links.create(&unit.id, home))
                .await?;

            let allocated = self.pool.lock().await.allocate(&unit.id);
            match allocated {
                Ok(slot) => {
                    self.registry
                        .set_slot(&unit.id, Some(slot), Some(link_address(slot)))
                        .await?;
                }
                Err(e) => warn!(unit_id = %unit.id, error = %e, "unit left without a slot"),
            }
        }

        let mut connected = 0;
        for unit in &units {
            match self.monitor.connect(&unit.id).await {
                Ok(true) => connected += 1,
                Ok(false) => warn!(unit_id = %unit.id, "unit did not connect"),
                Err(e) => error!(unit_id = %unit.id, error = %e, "unit connect failed"),
            }
        }
        info!(units = units.len(), connected, "fleet online");

        loops.push(self.scheduler.spawn(self.shutdown.signal()));
        loops.push(self.scheduler.spawn_overdue_scan(self.shutdown.signal()));
        self.telemetry.start_all().await;
        Ok(())
    }

    /// Retry the connection of a unit, e.g. one left in `Error`.
    pub async fn reconnect(&self, unit_id: &str) -> ControlResult<bool> {
        Ok(self.monitor.connect(unit_id).await?)
    }

    /// Stop every loop, abort running missions, return all slots, and take
    /// the fleet `Offline`.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.shutdown.trigger();
        let loops: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        self.telemetry.stop_all().await;
        self.executor.shutdown().await;
        self.monitor.stop_all().await;

        {
            let mut pool = self.pool.lock().await;
            for unit_id in self.registry.unit_ids().await {
                pool.release(&unit_id);
            }
        }
        self.registry.shutdown().await;
        info!("orchestrator stopped");
    }

    /// Subscribe to every notification the components publish.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn config(&self) -> &SkyConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &MissionExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &TelemetryAggregator {
        &self.telemetry
    }
}

#[cfg(test)]
mod tests {
    use skygrid_link::ScriptedLinkFactory;

    use super::*;

    fn config() -> SkyConfig {
        let mut config = SkyConfig::default();
        config.slots.base = 100;
        config.slots.probe = false;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_and_connects_default_fleet() {
        let links = Arc::new(ScriptedLinkFactory::new());
        let orch = Orchestrator::new(config(), JobStore::open_in_memory().unwrap(), links.clone());
        orch.start().await.unwrap();

        let units = orch.registry().units().await;
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].name, "Alpha");
        assert_eq!(units[0].slot, Some(100));
        assert_eq!(units[3].link_address.as_deref(), Some("udp://:103"));
        assert!(units.iter().all(|u| u.connected));
        assert!(links.link("unit-4").is_some());

        assert!(matches!(orch.start().await, Err(ControlError::AlreadyStarted)));
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_without_slot_stays_offline() {
        let mut config = config();
        config.slots.count = 2;
        let orch = Orchestrator::new(
            config,
            JobStore::open_in_memory().unwrap(),
            Arc::new(ScriptedLinkFactory::new()),
        );
        orch.start().await.unwrap();

        let stats = orch.registry().statistics().await;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.online, 2);
        let third = orch.registry().unit("unit-3").await.unwrap();
        assert_eq!(third.slot, None);
        assert!(!third.connected);
        orch.shutdown().await;
    }

    #[test]
    fn test_unknown_link_kind() {
        let mut config = config();
        config.link.kind = "mavlink".to_string();
        let result = Orchestrator::from_config(config, JobStore::open_in_memory().unwrap());
        assert!(matches!(result, Err(ControlError::UnknownLinkKind(k)) if k == "mavlink"));
    }
}
