//! Mission executor: drives one task per dispatched job.
//!
//! `execute_job` binds a unit and spawns a flow that runs independently:
//!
//! ```text
//!   upload ─▶ arm ─▶ start ─▶ poll progress ─┬─▶ complete ─▶ Returning ─▶ settle ─▶ release
//!                                            ├─▶ refused / timeout ─▶ abort link ─▶ release
//!                                            └─▶ link fault ─────────▶ abort link ─▶ unit Error
//! ```
//!
//! Every flow ends by handing its unit back to the registry, including
//! when it is cancelled by `abort_job` or `shutdown`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use sky_core::config::MissionConfig;
use sky_core::notify::publish_json;
use sky_core::{NullNotifier, SharedNotifier, Task, TaskStatus, Topic};
use skygrid_link::{LinkError, LinkResult, SharedLink};
use skygrid_registry::{FleetRegistry, UnitStatus};
use skygrid_state::{Job, JobStatus, JobStore, JobUpdate};

use crate::error::{MissionError, MissionResult};

/// Finished tasks kept for inspection.
const FINISHED_TASKS_KEPT: usize = 100;

const ABORT_REASON: &str = "aborted by request";
const SHUTDOWN_REASON: &str = "aborted: executor shutdown";

/// Upper bound on a return-to-home command.
const ABORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-job flow state.
struct FlowSlot {
    unit_id: String,
    task: Arc<RwLock<Task>>,
    /// Carries the cancellation reason.
    cancel_tx: watch::Sender<Option<String>>,
    handle: Option<JoinHandle<()>>,
}

/// How a flow ended.
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed { reason: String, fault: bool },
    Aborted { reason: String },
}

impl Outcome {
    fn refused(step: &str) -> Self {
        Outcome::Failed {
            reason: format!("{step} rejected by unit"),
            fault: false,
        }
    }

    fn link_error(step: &str, e: LinkError) -> Self {
        Outcome::Failed {
            reason: format!("{step} failed: {e}"),
            fault: e.is_fault(),
        }
    }
}

#[derive(Serialize)]
struct TaskEvent<'a> {
    job_id: &'a str,
    task_id: &'a str,
    unit_id: &'a str,
    status: TaskStatus,
    progress: f64,
    current_waypoint_index: usize,
    failure_reason: Option<&'a str>,
}

#[derive(Serialize)]
struct JobEvent<'a> {
    job_id: &'a str,
    status: JobStatus,
    unit_id: Option<&'a str>,
    failure_reason: Option<&'a str>,
}

struct Shared {
    store: JobStore,
    registry: FleetRegistry,
    config: MissionConfig,
    /// Shared by every clone of the executor.
    notifier: std::sync::RwLock<SharedNotifier>,
    /// Running flows: job_id → slot.
    flows: RwLock<HashMap<String, FlowSlot>>,
    finished: RwLock<VecDeque<Task>>,
}

#[derive(Clone)]
pub struct MissionExecutor {
    shared: Arc<Shared>,
}

impl MissionExecutor {
    pub fn new(store: JobStore, registry: FleetRegistry, config: MissionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                config,
                notifier: std::sync::RwLock::new(Arc::new(NullNotifier)),
                flows: RwLock::new(HashMap::new()),
                finished: RwLock::new(VecDeque::new()),
            }),
        }
    }

    /// Set the notifier for this executor and every clone of it,
    /// including flows already running.
    pub fn with_notifier(self, notifier: SharedNotifier) -> Self {
        *self
            .shared
            .notifier
            .write()
            .unwrap_or_else(PoisonError::into_inner) = notifier;
        self
    }

    /// Bind a unit to `job` and start its flow. Returns the unit id.
    ///
    /// Fails with [`MissionError::NoUnitAvailable`] when no unit can take
    /// the job, and with a validation error when the job cannot be turned
    /// into a valid task. Neither touches any state.
    pub async fn execute_job(&self, job: &Job) -> MissionResult<String> {
        let job_id = job.id.as_str();
        if job.status.is_terminal() {
            return Err(MissionError::UnknownJob(job_id.to_string()));
        }
        if self.shared.flows.read().await.contains_key(job_id) {
            return Err(MissionError::AlreadyRunning(job_id.to_string()));
        }

        let registry = &self.shared.registry;
        let unit_id = registry
            .get_available_unit()
            .await
            .ok_or(MissionError::NoUnitAvailable)?;
        let task = Task::delivery(
            job_id,
            &unit_id,
            job.origin,
            job.destination,
            self.shared.config.task_params(),
        )?;
        let Some(link) = registry.link(&unit_id).await else {
            warn!(%unit_id, "available unit has no link");
            return Err(MissionError::NoUnitAvailable);
        };
        if !registry.assign_job(job_id, &unit_id).await {
            debug!(%job_id, %unit_id, "unit taken before assignment");
            return Err(MissionError::NoUnitAvailable);
        }

        let update = JobUpdate::status(JobStatus::Scheduled).with_unit(unit_id.as_str());
        if let Err(e) = self.shared.store.update(job_id, update) {
            registry.release(job_id).await;
            return Err(e.into());
        }

        self.shared.publish_task(&task);
        let task = Arc::new(RwLock::new(task));
        let (cancel_tx, cancel_rx) = watch::channel(None);
        {
            let mut flows = self.shared.flows.write().await;
            let handle = tokio::spawn(run_flow(
                self.shared.clone(),
                job_id.to_string(),
                unit_id.clone(),
                task.clone(),
                link,
                cancel_rx,
            ));
            flows.insert(
                job_id.to_string(),
                FlowSlot {
                    unit_id: unit_id.clone(),
                    task: task.clone(),
                    cancel_tx,
                    handle: Some(handle),
                },
            );
        }

        info!(%job_id, %unit_id, "mission started");
        Ok(unit_id)
    }

    /// Abort the task running for `job_id`. Returns false if no unit is
    /// bound to the job.
    ///
    /// Waits for the flow's release sequence, so on return the unit is
    /// handed back. A running task ends `Aborted` with its job `Failed`.
    /// A task that already completed keeps its status; only the settle
    /// period of its unit is cut short.
    pub async fn abort_job(&self, job_id: &str) -> bool {
        let found = {
            let mut flows = self.shared.flows.write().await;
            match flows.get_mut(job_id) {
                Some(slot) => {
                    let finished = slot.task.read().await.status.is_terminal();
                    slot.cancel_tx.send_replace(Some(ABORT_REASON.to_string()));
                    Some((finished, slot.handle.take()))
                }
                None => None,
            }
        };

        match found {
            Some((finished, handle)) => {
                if finished {
                    info!(%job_id, "task already finished, releasing its unit");
                } else {
                    info!(%job_id, "abort requested");
                }
                if let Some(handle) = handle {
                    if let Err(e) = handle.await {
                        error!(%job_id, error = %e, "mission flow panicked during abort");
                    }
                }
                true
            }
            None => self.abort_orphan(job_id).await,
        }
    }

    /// A unit bound to a job with no flow, e.g. after a flow panicked.
    async fn abort_orphan(&self, job_id: &str) -> bool {
        let registry = &self.shared.registry;
        let Some(unit_id) = registry.unit_for_job(job_id).await else {
            debug!(%job_id, "no unit bound to job");
            return false;
        };
        warn!(%job_id, %unit_id, "aborting job without a running flow");
        if let Some(link) = registry.link(&unit_id).await {
            command_abort(&link, job_id).await;
        }
        self.shared.update_job(job_id, JobUpdate::failed(ABORT_REASON));
        registry.release(job_id).await;
        true
    }

    /// job_id → unit_id for every running flow.
    pub async fn active_jobs(&self) -> BTreeMap<String, String> {
        self.shared
            .flows
            .read()
            .await
            .iter()
            .map(|(job, slot)| (job.clone(), slot.unit_id.clone()))
            .collect()
    }

    /// Snapshot of the task for `job_id`, running or recently finished.
    pub async fn task(&self, job_id: &str) -> Option<Task> {
        let task = self
            .shared
            .flows
            .read()
            .await
            .get(job_id)
            .map(|slot| slot.task.clone());
        if let Some(task) = task {
            return Some(task.read().await.clone());
        }
        let finished = self.shared.finished.read().await;
        finished.iter().rev().find(|t| t.job_id == job_id).cloned()
    }

    /// Snapshots of every running task.
    pub async fn tasks(&self) -> Vec<Task> {
        let handles: Vec<Arc<RwLock<Task>>> = self
            .shared
            .flows
            .read()
            .await
            .values()
            .map(|slot| slot.task.clone())
            .collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for task in handles {
            tasks.push(task.read().await.clone());
        }
        tasks
    }

    /// Number of tasks currently `Executing`.
    pub async fn executing_count(&self) -> usize {
        self.tasks()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::Executing)
            .count()
    }

    /// Cancel every flow and wait for each to release its unit.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut flows = self.shared.flows.write().await;
            flows
                .iter_mut()
                .filter_map(|(job_id, slot)| {
                    slot.cancel_tx.send_replace(Some(SHUTDOWN_REASON.to_string()));
                    slot.handle.take().map(|h| (job_id.clone(), h))
                })
                .collect()
        };
        let count = handles.len();
        for (job_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(%job_id, error = %e, "mission flow panicked during shutdown");
            }
        }
        info!(flows = count, "mission executor shut down");
    }
}

async fn run_flow(
    shared: Arc<Shared>,
    job_id: String,
    unit_id: String,
    task: Arc<RwLock<Task>>,
    link: SharedLink,
    mut cancel: watch::Receiver<Option<String>>,
) {
    let outcome = tokio::select! {
        outcome = shared.drive(&job_id, &unit_id, &task, &link) => outcome,
        reason = cancelled(&mut cancel) => Outcome::Aborted { reason },
    };
    debug!(%job_id, %unit_id, ?outcome, "mission flow resolved");
    shared.finish(&job_id, &unit_id, &task, &link, outcome, &mut cancel).await;
    shared.retire(&job_id, &task).await;
}

/// Resolves with the cancellation reason.
async fn cancelled(rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return SHUTDOWN_REASON.to_string();
        }
    }
}

/// The outcome of a link command that was not accepted in time, if any.
fn rejection(
    step: &str,
    reply: Result<LinkResult<bool>, Elapsed>,
    timed_out: impl FnOnce() -> Outcome,
) -> Option<Outcome> {
    match reply {
        Ok(Ok(true)) => None,
        Ok(Ok(false)) => Some(Outcome::refused(step)),
        Ok(Err(e)) => Some(Outcome::link_error(step, e)),
        Err(_) => Some(timed_out()),
    }
}

/// Command return-to-home; failures are only logged.
async fn command_abort(link: &SharedLink, job_id: &str) {
    match timeout(ABORT_TIMEOUT, link.abort()).await {
        Ok(Ok(true)) => debug!(%job_id, "link abort acknowledged"),
        Ok(Ok(false)) => warn!(%job_id, "link refused abort"),
        Ok(Err(e)) => warn!(%job_id, error = %e, "link abort failed"),
        Err(_) => warn!(%job_id, secs = ABORT_TIMEOUT.as_secs(), "link abort timed out"),
    }
}

impl Shared {
    async fn drive(
        &self,
        job_id: &str,
        unit_id: &str,
        task: &RwLock<Task>,
        link: &SharedLink,
    ) -> Outcome {
        let snapshot = task.read().await.clone();
        let deadline = Instant::now() + snapshot.params.timeout();
        let timed_out = || Outcome::Failed {
            reason: format!("timed out after {}s", snapshot.params.timeout_secs),
            fault: false,
        };

        let uploaded = timeout_at(deadline, link.upload_task(&snapshot)).await;
        if let Some(outcome) = rejection("task upload", uploaded, timed_out) {
            return outcome;
        }
        self.set_task_status(task, TaskStatus::Uploaded, None).await;
        self.set_unit_status(unit_id, UnitStatus::InFlight).await;
        self.update_job(job_id, JobUpdate::status(JobStatus::InFlight).with_unit(unit_id));

        let armed = timeout_at(deadline, link.arm()).await;
        if let Some(outcome) = rejection("arm", armed, timed_out) {
            return outcome;
        }
        let launched = timeout_at(deadline, link.start()).await;
        if let Some(outcome) = rejection("start", launched, timed_out) {
            return outcome;
        }
        self.set_task_status(task, TaskStatus::Executing, None).await;
        self.set_unit_status(unit_id, UnitStatus::MissionActive).await;

        let started = Instant::now();
        loop {
            tokio::time::sleep(self.config.poll_interval()).await;
            if Instant::now() >= deadline {
                return timed_out();
            }

            let Ok(polled) = timeout_at(deadline, link.mission_progress()).await else {
                return timed_out();
            };
            match polled {
                Ok(progress) => {
                    let advanced = {
                        let mut t = task.write().await;
                        let before = t.progress;
                        if progress.total > 0 {
                            t.record_progress(progress.current, progress.total);
                        } else {
                            let estimate = t.time_progress(started.elapsed());
                            t.record_estimate(estimate);
                        }
                        t.progress > before
                    };
                    if advanced {
                        self.publish_task(&*task.read().await);
                    }
                    if progress.is_complete() {
                        return Outcome::Completed;
                    }
                }
                Err(e) if e.is_fault() => return Outcome::link_error("progress query", e),
                Err(e) => warn!(%job_id, error = %e, "progress query failed, retrying"),
            }
        }
    }

    async fn finish(
        &self,
        job_id: &str,
        unit_id: &str,
        task: &RwLock<Task>,
        link: &SharedLink,
        outcome: Outcome,
        cancel: &mut watch::Receiver<Option<String>>,
    ) {
        match outcome {
            Outcome::Completed => {
                self.set_task_status(task, TaskStatus::Completed, None).await;
                self.update_job(job_id, JobUpdate::status(JobStatus::Completed));
                self.set_unit_status(unit_id, UnitStatus::Returning).await;
                info!(%job_id, %unit_id, "mission completed");

                tokio::select! {
                    _ = tokio::time::sleep(self.config.settle_delay()) => {}
                    _ = cancelled(cancel) => debug!(%job_id, "settle cut short"),
                }
                self.registry.release(job_id).await;
            }
            Outcome::Failed { reason, fault } => {
                error!(%job_id, %unit_id, %reason, fault, "mission failed");
                command_abort(link, job_id).await;
                self.set_task_status(task, TaskStatus::Failed, Some(&reason)).await;
                self.update_job(job_id, JobUpdate::failed(reason.as_str()));
                if fault {
                    self.registry.release_faulted(job_id).await;
                } else {
                    self.registry.release(job_id).await;
                }
            }
            Outcome::Aborted { reason } => {
                warn!(%job_id, %unit_id, %reason, "mission aborted");
                command_abort(link, job_id).await;
                self.set_task_status(task, TaskStatus::Aborted, Some(&reason)).await;
                self.update_job(job_id, JobUpdate::failed(reason.as_str()));
                self.registry.release(job_id).await;
            }
        }
    }

    /// Drop the flow and archive its task.
    async fn retire(&self, job_id: &str, task: &RwLock<Task>) {
        self.flows.write().await.remove(job_id);
        let snapshot = task.read().await.clone();
        let mut finished = self.finished.write().await;
        if finished.len() == FINISHED_TASKS_KEPT {
            finished.pop_front();
        }
        finished.push_back(snapshot);
    }

    async fn set_task_status(&self, task: &RwLock<Task>, next: TaskStatus, reason: Option<&str>) {
        let snapshot = {
            let mut t = task.write().await;
            let from = t.status;
            if !t.transition(next) {
                warn!(task_id = %t.id, ?from, to = ?next, "illegal task transition ignored");
                return;
            }
            if let Some(reason) = reason {
                t.failure_reason = Some(reason.to_string());
            }
            t.clone()
        };
        debug!(task_id = %snapshot.id, status = ?next, "task transition");
        self.publish_task(&snapshot);
    }

    async fn set_unit_status(&self, unit_id: &str, to: UnitStatus) {
        // The registry logs rejected moves.
        let _ = self.registry.transition(unit_id, to).await;
    }

    fn notifier(&self) -> SharedNotifier {
        self.notifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_job(&self, job_id: &str, update: JobUpdate) {
        match self.store.update(job_id, update) {
            Ok(job) => publish_json(
                self.notifier().as_ref(),
                Topic::JobStatus,
                &JobEvent {
                    job_id,
                    status: job.status,
                    unit_id: job.unit_id.as_deref(),
                    failure_reason: job.failure_reason.as_deref(),
                },
            ),
            Err(e) => error!(%job_id, error = %e, "failed to update job"),
        }
    }

    fn publish_task(&self, task: &Task) {
        publish_json(
            self.notifier().as_ref(),
            Topic::TaskStatus,
            &TaskEvent {
                job_id: &task.job_id,
                task_id: &task.id,
                unit_id: &task.unit_id,
                status: task.status,
                progress: task.progress,
                current_waypoint_index: task.current_waypoint_index,
                failure_reason: task.failure_reason.as_deref(),
            },
        );
    }
}
