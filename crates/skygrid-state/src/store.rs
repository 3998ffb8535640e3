//! JobStore: redb-backed job persistence for SkyGrid.
//!
//! Provides create/get/list/update over delivery jobs. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe job store backed by redb.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    /// Open (or create) a persistent job store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "job store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory job store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory job store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Create a job in `Pending` status and return its id.
    pub fn create(&self, new: NewJob) -> StateResult<JobId> {
        let now = sky_core::epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let last = meta
                .get(JOB_SEQ_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let seq = last + 1;
            meta.insert(JOB_SEQ_KEY, seq).map_err(map_err!(Write))?;
            id = format!("job-{seq:06}");

            let job = Job {
                id: id.clone(),
                origin: new.origin,
                destination: new.destination,
                priority: new.priority,
                status: JobStatus::Pending,
                unit_id: None,
                failure_reason: None,
                created_at: new.created_at.unwrap_or(now),
                scheduled_at: None,
                started_at: None,
                completed_at: None,
                updated_at: now,
            };
            let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            jobs.insert(id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %id, "job created");
        Ok(id)
    }

    /// Get a job by id.
    pub fn get(&self, id: &str) -> StateResult<Job> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    /// List jobs, optionally filtered by status, in dispatch order
    /// (oldest first, then higher priority).
    pub fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> StateResult<Vec<Job>> {
        let mut jobs = self.scan(|job| status.is_none_or(|s| job.status == s))?;
        jobs.sort_by(Job::dispatch_order);
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    /// Number of jobs in each status.
    pub fn count_by_status(&self) -> StateResult<HashMap<JobStatus, usize>> {
        let mut counts = HashMap::new();
        for job in self.scan(|_| true)? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Apply a partial update. Status changes must follow the job
    /// lifecycle; the matching timestamp is stamped automatically.
    pub fn update(&self, id: &str, update: JobUpdate) -> StateResult<Job> {
        let now = sky_core::epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let job = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let raw = table
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(id.to_string()))?;
            let mut job: Job = serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;

            if let Some(next) = update.status {
                if !job.status.can_transition_to(next) {
                    return Err(StateError::InvalidTransition {
                        id: id.to_string(),
                        from: job.status,
                        to: next,
                    });
                }
                if next != job.status {
                    match next {
                        JobStatus::Scheduled => job.scheduled_at = Some(now),
                        JobStatus::InFlight => job.started_at = Some(now),
                        JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(now),
                        JobStatus::Pending => {}
                    }
                }
                job.status = next;
            }
            if let Some(unit_id) = update.unit_id {
                job.unit_id = Some(unit_id);
            }
            if let Some(reason) = update.failure_reason {
                job.failure_reason = Some(reason);
            }
            job.updated_at = now;

            let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            job
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %id, status = ?job.status, "job updated");
        Ok(job)
    }

    /// Read every job matching `keep`.
    fn scan(&self, keep: impl Fn(&Job) -> bool) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: Job = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&job) {
                results.push(job);
            }
        }
        Ok(results)
    }
}
