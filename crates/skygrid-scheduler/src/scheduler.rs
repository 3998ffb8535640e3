//! Job scheduler: the dispatch loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sky_core::config::SchedulerConfig;
use sky_core::notify::publish_json;
use sky_core::{NullNotifier, SharedNotifier, ShutdownSignal, Topic, epoch_secs, spawn_periodic};
use skygrid_mission::MissionExecutor;
use skygrid_registry::FleetRegistry;
use skygrid_state::{Job, JobId, JobStatus, JobStore, JobUpdate, Priority};

use crate::error::SchedulerResult;

/// Reason recorded on jobs that ran out of dispatch attempts.
pub const DISPATCH_EXHAUSTED: &str = "dispatch exhausted";

/// Dispatch counters since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub cycles: u64,
    /// Cycles that found no available unit.
    pub idle_cycles: u64,
    pub dispatched: u64,
    pub retried: u64,
    pub exhausted: u64,
    /// Jobs failed because they could not become a valid task.
    pub rejected: u64,
    /// Attempts held back because the offered unit could not fly the route.
    pub low_battery: u64,
}

/// Snapshot of the dispatch queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub pending_by_priority: BTreeMap<Priority, usize>,
    /// Scheduled jobs waiting for another attempt, with attempts so far.
    pub retrying: BTreeMap<JobId, u32>,
}

/// Published on [`Topic::Alert`] when unfinished jobs pass their age limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueAlert {
    pub severity: &'static str,
    pub message: String,
    pub overdue_count: usize,
    pub job_ids: Vec<JobId>,
}

/// Battery fraction a route of `distance_km` is expected to use.
pub fn route_battery(distance_km: f64, per_km: f64) -> f64 {
    (distance_km * per_km).clamp(0.0, 1.0)
}

#[derive(Default)]
struct DispatchState {
    /// Failed dispatch attempts per job.
    attempts: HashMap<JobId, u32>,
    stats: DispatchStats,
}

#[derive(Clone)]
pub struct JobScheduler {
    store: JobStore,
    registry: FleetRegistry,
    executor: MissionExecutor,
    config: SchedulerConfig,
    notifier: SharedNotifier,
    state: Arc<Mutex<DispatchState>>,
}

impl JobScheduler {
    pub fn new(
        store: JobStore,
        registry: FleetRegistry,
        executor: MissionExecutor,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            config,
            notifier: Arc::new(NullNotifier),
            state: Arc::new(Mutex::new(DispatchState::default())),
        }
    }

    pub fn with_notifier(mut self, notifier: SharedNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run [`tick`](Self::tick) every configured interval until `signal` fires.
    pub fn spawn(&self, signal: ShutdownSignal) -> JoinHandle<()> {
        let scheduler = self.clone();
        info!(interval_ms = self.config.interval_ms, "dispatch loop starting");
        spawn_periodic("dispatch", self.config.interval(), signal, move || {
            let scheduler = scheduler.clone();
            async move {
                scheduler.tick().await?;
                Ok(())
            }
        })
    }

    /// Run [`scan_overdue`](Self::scan_overdue) every configured interval
    /// until `signal` fires.
    pub fn spawn_overdue_scan(&self, signal: ShutdownSignal) -> JoinHandle<()> {
        let scheduler = self.clone();
        spawn_periodic(
            "overdue-scan",
            self.config.overdue_scan_interval(),
            signal,
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.scan_overdue(epoch_secs())?;
                    Ok(())
                }
            },
        )
    }

    /// Unfinished jobs created more than `overdue_after_secs` before `now`.
    /// Publishes one warning alert when there are any.
    pub fn scan_overdue(&self, now: u64) -> SchedulerResult<Vec<JobId>> {
        let job_ids: Vec<JobId> = self
            .store
            .list(None, usize::MAX, 0)?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .filter(|job| now.saturating_sub(job.created_at) > self.config.overdue_after_secs)
            .map(|job| job.id)
            .collect();
        if job_ids.is_empty() {
            return Ok(job_ids);
        }

        warn!(count = job_ids.len(), ?job_ids, "jobs overdue");
        publish_json(
            self.notifier.as_ref(),
            Topic::Alert,
            &OverdueAlert {
                severity: "warning",
                message: format!("{} jobs are overdue", job_ids.len()),
                overdue_count: job_ids.len(),
                job_ids: job_ids.clone(),
            },
        );
        Ok(job_ids)
    }

    /// One dispatch cycle. Returns how many jobs were handed to the executor.
    pub async fn tick(&self) -> SchedulerResult<usize> {
        let mut dispatched = 0;
        self.state.lock().await.stats.cycles += 1;

        for _ in 0..self.config.jobs_per_cycle.max(1) {
            let Some(unit_id) = self.registry.get_available_unit().await else {
                if dispatched == 0 {
                    debug!("no available unit, skipping cycle");
                    self.state.lock().await.stats.idle_cycles += 1;
                }
                break;
            };
            let Some(job) = self.next_candidate().await? else {
                break;
            };
            if !self.dispatch(job, &unit_id).await? {
                break;
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Scheduled jobs without a running task come first (retries, or jobs
    /// left over from a previous run), then the oldest pending job.
    async fn next_candidate(&self) -> SchedulerResult<Option<Job>> {
        let active: HashSet<String> = self.executor.active_jobs().await.into_keys().collect();
        let waiting = self
            .store
            .list(Some(JobStatus::Scheduled), usize::MAX, 0)?
            .into_iter()
            .find(|job| !active.contains(&job.id));
        if waiting.is_some() {
            return Ok(waiting);
        }
        Ok(self
            .store
            .list(Some(JobStatus::Pending), 1, 0)?
            .into_iter()
            .next())
    }

    /// Returns true if the job was handed off. `unit_id` is the unit the
    /// executor is expected to pick.
    async fn dispatch(&self, job: Job, unit_id: &str) -> SchedulerResult<bool> {
        let job = if job.status == JobStatus::Pending {
            self.store
                .update(&job.id, JobUpdate::status(JobStatus::Scheduled))?
        } else {
            job
        };

        if let Some(reason) = self.battery_shortfall(&job, unit_id).await {
            self.state.lock().await.stats.low_battery += 1;
            return self.retry_later(&job, &reason).await;
        }

        match self.executor.execute_job(&job).await {
            Ok(unit_id) => {
                let mut state = self.state.lock().await;
                state.attempts.remove(&job.id);
                state.stats.dispatched += 1;
                info!(job_id = %job.id, %unit_id, priority = ?job.priority, "job dispatched");
                Ok(true)
            }
            Err(e) if e.is_retryable() => self.retry_later(&job, &e.to_string()).await,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.attempts.remove(&job.id);
                state.stats.rejected += 1;
                drop(state);
                warn!(job_id = %job.id, error = %e, "job cannot be dispatched");
                self.store
                    .update(&job.id, JobUpdate::failed(format!("dispatch failed: {e}")))?;
                Ok(false)
            }
        }
    }

    /// Why `unit_id` cannot fly `job` with its dispatch reserve left over.
    async fn battery_shortfall(&self, job: &Job, unit_id: &str) -> Option<String> {
        let unit = self.registry.unit(unit_id).await?;
        let required = route_battery(job.distance_km(), self.config.battery_per_km)
            + self.registry.min_dispatch_battery();
        (unit.battery < required).then(|| {
            format!(
                "unit {unit_id} has {:.0}% battery, route needs {:.0}%",
                unit.battery * 100.0,
                required * 100.0
            )
        })
    }

    /// Count a failed attempt; the job fails once its budget is spent.
    async fn retry_later(&self, job: &Job, reason: &str) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let attempts = state.attempts.entry(job.id.clone()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        if attempts > self.config.max_retries {
            state.attempts.remove(&job.id);
            state.stats.exhausted += 1;
            drop(state);
            warn!(job_id = %job.id, attempts, %reason, "dispatch attempts exhausted");
            self.store.update(&job.id, JobUpdate::failed(DISPATCH_EXHAUSTED))?;
        } else {
            state.stats.retried += 1;
            debug!(job_id = %job.id, attempts, %reason, "dispatch held back, will retry");
        }
        Ok(false)
    }

    pub async fn stats(&self) -> DispatchStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn queue_status(&self) -> SchedulerResult<QueueStatus> {
        let pending = self.store.list(Some(JobStatus::Pending), usize::MAX, 0)?;
        let mut pending_by_priority = BTreeMap::new();
        for job in &pending {
            *pending_by_priority.entry(job.priority).or_insert(0) += 1;
        }
        let retrying = self
            .state
            .lock()
            .await
            .attempts
            .iter()
            .map(|(id, n)| (id.clone(), *n))
            .collect();
        Ok(QueueStatus {
            pending: pending.len(),
            pending_by_priority,
            retrying,
        })
    }
}
