//! Telemetry aggregator: three independent loops over the fleet.
//!
//! - **collect** appends a record per connected unit to a bounded history
//! - **health** recomputes every unit's [`HealthMetric`]
//! - **fleet** produces a [`FleetSnapshot`]
//!
//! Each loop has its own shutdown and can be stopped or restarted without
//! touching the others. Results are published to the notifier and kept
//! for queries and export.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sky_core::config::TelemetryConfig;
use sky_core::notify::publish_json;
use sky_core::{NullNotifier, Position, SharedNotifier, Shutdown, Topic, Velocity, epoch_millis, spawn_periodic};
use skygrid_mission::MissionExecutor;
use skygrid_registry::{FleetRegistry, FleetStatistics, UnitStatus};

use crate::error::{TelemetryError, TelemetryResult};
use crate::fleet::{FleetSnapshot, aggregate};
use crate::health::{HealthMetric, assess};

/// One history entry for a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub unit_id: String,
    /// When the aggregator took the record, epoch ms.
    pub recorded_at_ms: u64,
    /// When the unit produced the underlying sample, epoch ms.
    pub sample_ms: u64,
    pub position: Option<Position>,
    pub velocity: Option<Velocity>,
    pub battery: f64,
    pub status: UnitStatus,
    pub job_id: Option<String>,
}

/// Registry counters merged with health counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryStatistics {
    pub fleet: FleetStatistics,
    pub units_with_telemetry: usize,
    pub healthy: usize,
    pub with_warnings: usize,
    pub with_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Collect,
    Health,
    Fleet,
}

impl LoopKind {
    pub const ALL: [LoopKind; 3] = [LoopKind::Collect, LoopKind::Health, LoopKind::Fleet];

    fn name(self) -> &'static str {
        match self {
            LoopKind::Collect => "telemetry-collect",
            LoopKind::Health => "health-assess",
            LoopKind::Fleet => "fleet-aggregate",
        }
    }
}

struct LoopSlot {
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Data {
    history: HashMap<String, VecDeque<TelemetryRecord>>,
    health: HashMap<String, HealthMetric>,
    snapshot: Option<FleetSnapshot>,
}

#[derive(Clone)]
pub struct TelemetryAggregator {
    registry: FleetRegistry,
    executor: MissionExecutor,
    config: TelemetryConfig,
    notifier: SharedNotifier,
    data: Arc<RwLock<Data>>,
    loops: Arc<Mutex<HashMap<LoopKind, LoopSlot>>>,
}

impl TelemetryAggregator {
    pub fn new(registry: FleetRegistry, executor: MissionExecutor, config: TelemetryConfig) -> Self {
        Self {
            registry,
            executor,
            config,
            notifier: Arc::new(NullNotifier),
            data: Arc::new(RwLock::new(Data::default())),
            loops: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_notifier(mut self, notifier: SharedNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    // ── Loop control ────────────────────────────────────────────

    pub async fn start_all(&self) {
        for kind in LoopKind::ALL {
            self.start(kind).await;
        }
    }

    /// Start one loop, replacing it if it is already running.
    pub async fn start(&self, kind: LoopKind) {
        let period = match kind {
            LoopKind::Collect => self.config.collect_interval_ms,
            LoopKind::Health => self.config.health_interval_ms,
            LoopKind::Fleet => self.config.fleet_interval_ms,
        };
        let shutdown = Shutdown::new();
        let aggregator = self.clone();
        let handle = spawn_periodic(
            kind.name(),
            std::time::Duration::from_millis(period),
            shutdown.signal(),
            move || {
                let aggregator = aggregator.clone();
                async move {
                    match kind {
                        LoopKind::Collect => {
                            aggregator.collect_once().await;
                        }
                        LoopKind::Health => {
                            aggregator.assess_once().await;
                        }
                        LoopKind::Fleet => {
                            aggregator.aggregate_once().await;
                        }
                    }
                    Ok(())
                }
            },
        );

        let mut loops = self.loops.lock().await;
        if let Some(old) = loops.insert(kind, LoopSlot { shutdown, handle }) {
            old.shutdown.trigger();
            old.handle.abort();
        }
        info!(loop_name = kind.name(), period_ms = period, "telemetry loop started");
    }

    pub async fn stop(&self, kind: LoopKind) {
        let slot = self.loops.lock().await.remove(&kind);
        if let Some(slot) = slot {
            slot.shutdown.trigger();
            if let Err(e) = slot.handle.await {
                warn!(loop_name = kind.name(), error = %e, "telemetry loop ended abnormally");
            }
            debug!(loop_name = kind.name(), "telemetry loop stopped");
        }
    }

    pub async fn restart(&self, kind: LoopKind) {
        self.stop(kind).await;
        self.start(kind).await;
    }

    pub async fn stop_all(&self) {
        for kind in LoopKind::ALL {
            self.stop(kind).await;
        }
        info!("telemetry loops stopped");
    }

    pub async fn running(&self) -> Vec<LoopKind> {
        let mut kinds: Vec<LoopKind> = self
            .loops
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    // ── Single iterations ───────────────────────────────────────

    /// Append a record for every connected unit that has reported
    /// telemetry. Returns how many records were added.
    pub async fn collect_once(&self) -> usize {
        let now = epoch_millis();
        let records: Vec<TelemetryRecord> = self
            .registry
            .units()
            .await
            .into_iter()
            .filter(|u| u.connected)
            .filter_map(|u| {
                let sample_ms = u.last_telemetry_ms?;
                Some(TelemetryRecord {
                    unit_id: u.id,
                    recorded_at_ms: now,
                    sample_ms,
                    position: u.last_position,
                    velocity: u.last_velocity,
                    battery: u.battery,
                    status: u.status,
                    job_id: u.current_job_id,
                })
            })
            .collect();

        {
            let mut data = self.data.write().await;
            for record in &records {
                let history = data.history.entry(record.unit_id.clone()).or_default();
                if history.len() >= self.config.history_len.max(1) {
                    history.pop_front();
                }
                history.push_back(record.clone());
            }
        }
        for record in &records {
            publish_json(self.notifier.as_ref(), Topic::Telemetry, record);
        }
        records.len()
    }

    /// Recompute health for every unit.
    pub async fn assess_once(&self) -> Vec<HealthMetric> {
        let now = epoch_millis();
        let stale_after = std::time::Duration::from_secs(self.config.stale_after_secs);
        let units = self.registry.units().await;

        let metrics: Vec<HealthMetric> = {
            let data = self.data.read().await;
            units
                .iter()
                .map(|u| {
                    let last = data
                        .history
                        .get(&u.id)
                        .and_then(|h| h.back())
                        .map(|r| r.sample_ms);
                    assess(u, last, now, stale_after)
                })
                .collect()
        };

        {
            let mut data = self.data.write().await;
            for metric in &metrics {
                data.health.insert(metric.unit_id.clone(), metric.clone());
            }
        }
        for metric in &metrics {
            if !metric.healthy {
                warn!(unit_id = %metric.unit_id, errors = ?metric.errors, "unit unhealthy");
            }
            publish_json(self.notifier.as_ref(), Topic::Health, metric);
        }
        metrics
    }

    pub async fn aggregate_once(&self) -> FleetSnapshot {
        let units = self.registry.units().await;
        let executing = self.executor.executing_count().await;
        let snapshot = aggregate(&units, executing, epoch_millis());

        self.data.write().await.snapshot = Some(snapshot.clone());
        publish_json(self.notifier.as_ref(), Topic::FleetSnapshot, &snapshot);
        debug!(
            fleet_status = snapshot.fleet_status.as_str(),
            connected = snapshot.connected_units,
            executing,
            "fleet snapshot"
        );
        snapshot
    }

    // ── Queries ─────────────────────────────────────────────────

    /// The newest `limit` records for a unit, oldest first.
    pub async fn history(&self, unit_id: &str, limit: usize) -> TelemetryResult<Vec<TelemetryRecord>> {
        if self.registry.unit(unit_id).await.is_none() {
            return Err(TelemetryError::UnknownUnit(unit_id.to_string()));
        }
        let data = self.data.read().await;
        let Some(history) = data.history.get(unit_id) else {
            return Ok(Vec::new());
        };
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    pub async fn health(&self, unit_id: &str) -> Option<HealthMetric> {
        self.data.read().await.health.get(unit_id).cloned()
    }

    /// Latest health metric for every assessed unit, by unit id.
    pub async fn health_all(&self) -> BTreeMap<String, HealthMetric> {
        self.data
            .read()
            .await
            .health
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect()
    }

    pub async fn latest_snapshot(&self) -> Option<FleetSnapshot> {
        self.data.read().await.snapshot.clone()
    }

    pub async fn statistics(&self) -> TelemetryStatistics {
        let fleet = self.registry.statistics().await;
        let data = self.data.read().await;
        TelemetryStatistics {
            fleet,
            units_with_telemetry: data.history.values().filter(|h| !h.is_empty()).count(),
            healthy: data.health.values().filter(|m| m.healthy).count(),
            with_warnings: data.health.values().filter(|m| m.has_warnings()).count(),
            with_errors: data.health.values().filter(|m| m.has_errors()).count(),
        }
    }

    /// JSON export of one unit's history, or of every unit's history
    /// keyed by unit id.
    pub async fn export(&self, unit_id: Option<&str>) -> TelemetryResult<String> {
        match unit_id {
            Some(id) => {
                let records = self.history(id, usize::MAX).await?;
                Ok(serde_json::to_string_pretty(&records)?)
            }
            None => {
                let data = self.data.read().await;
                let all: BTreeMap<&str, Vec<&TelemetryRecord>> = data
                    .history
                    .iter()
                    .map(|(id, h)| (id.as_str(), h.iter().collect()))
                    .collect();
                Ok(serde_json::to_string_pretty(&all)?)
            }
        }
    }
}
