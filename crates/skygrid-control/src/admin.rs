//! Administrative surface. Plain values in and out; transports live
//! elsewhere.

use serde::Serialize;
use tracing::{info, warn};

use sky_core::{Coordinates, Task};
use skygrid_registry::{RegistryError, UnitTransition, WorkUnit};
use skygrid_scheduler::{DispatchStats, QueueStatus};
use skygrid_slots::{Inconsistency, PoolStatistics, RepairReport, ResourceSlot, link_address};
use skygrid_state::{Job, JobId, JobStatus, NewJob, Priority};
use skygrid_telemetry::{HealthMetric, TelemetryStatistics};

use crate::error::ControlResult;
use crate::orchestrator::Orchestrator;

/// Everything known about one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitDetail {
    pub unit: WorkUnit,
    pub health: Option<HealthMetric>,
    pub task: Option<Task>,
    pub transitions: Vec<UnitTransition>,
}

/// Result of [`Orchestrator::auto_repair`].
#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub report: RepairReport,
    /// Units whose slot changed, with the new slot.
    pub readdressed: Vec<(String, Option<u16>)>,
}

impl Orchestrator {
    // ── Jobs ────────────────────────────────────────────────────

    pub fn submit_job(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        priority: Priority,
    ) -> ControlResult<JobId> {
        let id = self.store.create(NewJob::new(origin, destination, priority))?;
        info!(job_id = %id, ?priority, "job submitted");
        Ok(id)
    }

    pub fn job(&self, job_id: &str) -> ControlResult<Job> {
        Ok(self.store.get(job_id)?)
    }

    pub fn jobs(&self, status: Option<JobStatus>, limit: usize, offset: usize) -> ControlResult<Vec<Job>> {
        Ok(self.store.list(status, limit, offset)?)
    }

    /// Abort the mission running for `job_id`. False if nothing is bound
    /// to the job.
    pub async fn abort(&self, job_id: &str) -> bool {
        self.executor.abort_job(job_id).await
    }

    pub async fn queue_status(&self) -> ControlResult<QueueStatus> {
        Ok(self.scheduler.queue_status().await?)
    }

    pub async fn dispatch_stats(&self) -> DispatchStats {
        self.scheduler.stats().await
    }

    // ── Fleet ───────────────────────────────────────────────────

    pub async fn fleet_statistics(&self) -> TelemetryStatistics {
        self.telemetry.statistics().await
    }

    pub async fn units(&self) -> Vec<WorkUnit> {
        self.registry.units().await
    }

    pub async fn unit_detail(&self, unit_id: &str) -> ControlResult<UnitDetail> {
        let unit = self
            .registry
            .unit(unit_id)
            .await
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))?;
        let task = match &unit.current_job_id {
            Some(job_id) => self.executor.task(job_id).await,
            None => None,
        };
        Ok(UnitDetail {
            health: self.telemetry.health(unit_id).await,
            transitions: self.registry.transitions(unit_id).await?,
            task,
            unit,
        })
    }

    // ── Slots ───────────────────────────────────────────────────

    pub async fn slot_status(&self) -> Vec<ResourceSlot> {
        self.pool.lock().await.status()
    }

    pub async fn slot_statistics(&self) -> PoolStatistics {
        self.pool.lock().await.statistics()
    }

    pub async fn reserve_slot(&self, number: u16) -> ControlResult<()> {
        Ok(self.pool.lock().await.reserve(number)?)
    }

    pub async fn unreserve_slot(&self, number: u16) -> ControlResult<bool> {
        Ok(self.pool.lock().await.unreserve(number)?)
    }

    pub async fn validate_slots(&self) -> Vec<Inconsistency> {
        self.pool.lock().await.validate()
    }

    /// Repair the slot table and push any changed slot numbers and link
    /// addresses into the registry.
    pub async fn auto_repair(&self) -> ControlResult<RepairOutcome> {
        let (report, allocations) = {
            let mut pool = self.pool.lock().await;
            let report = pool.auto_repair();
            (report, pool.allocations())
        };

        let mut readdressed = Vec::new();
        for unit in self.registry.units().await {
            let slot = allocations.get(&unit.id).copied();
            if slot != unit.slot {
                self.registry
                    .set_slot(&unit.id, slot, slot.map(link_address))
                    .await?;
                warn!(unit_id = %unit.id, old = ?unit.slot, new = ?slot, "unit slot changed by repair");
                readdressed.push((unit.id, slot));
            }
        }
        Ok(RepairOutcome { report, readdressed })
    }

    // ── Telemetry ───────────────────────────────────────────────

    /// JSON export of one unit's telemetry history, or everyone's.
    pub async fn export_telemetry(&self, unit_id: Option<&str>) -> ControlResult<String> {
        Ok(self.telemetry.export(unit_id).await?)
    }
}
