//! Domain types for the SkyGrid job store.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sky_core::Coordinates;

/// Unique identifier for a job.
pub type JobId = String;

/// Delivery priority, ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Dispatch weight; higher goes first among equally old jobs.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    InFlight,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward edges: `Pending → Scheduled → InFlight → Completed`, and
    /// any unresolved job may fail. Re-asserting the current status is
    /// allowed for non-terminal jobs.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Scheduled) | (Scheduled, InFlight) | (InFlight, Completed) | (_, Failed)
        ) || self == next
    }
}

/// A customer delivery job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub origin: Coordinates,
    pub destination: Coordinates,
    pub priority: Priority,
    pub status: JobStatus,
    /// Unit the job was dispatched to, once known.
    pub unit_id: Option<String>,
    /// Human-readable reason for a `Failed` job.
    pub failure_reason: Option<String>,
    pub created_at: u64,
    pub scheduled_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub updated_at: u64,
}

impl Job {
    /// Dispatch order: oldest first, then higher priority, then id.
    pub fn dispatch_order(a: &Job, b: &Job) -> Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| b.priority.weight().cmp(&a.priority.weight()))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Straight-line delivery distance in kilometres.
    pub fn distance_km(&self) -> f64 {
        self.origin.distance_km(&self.destination)
    }
}

/// Fields for a job about to be created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    pub origin: Coordinates,
    pub destination: Coordinates,
    #[serde(default)]
    pub priority: Priority,
    /// Creation time; defaults to now. Set when rebuilding from another store.
    #[serde(default)]
    pub created_at: Option<u64>,
}

impl NewJob {
    pub fn new(origin: Coordinates, destination: Coordinates, priority: Priority) -> Self {
        Self {
            origin,
            destination,
            priority,
            created_at: None,
        }
    }

    pub fn at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Partial update applied by [`crate::JobStore::update`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub unit_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Shorthand for a transition to `Failed` with a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::status(JobStatus::Failed).with_reason(reason)
    }

    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!(Priority::High.weight(), 3);
    }

    fn job(id: &str, created_at: u64, priority: Priority) -> Job {
        Job {
            id: id.to_string(),
            origin: Coordinates::new(37.7749, -122.4194),
            destination: Coordinates::new(37.7849, -122.4094),
            priority,
            status: JobStatus::Pending,
            unit_id: None,
            failure_reason: None,
            created_at,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            updated_at: created_at,
        }
    }

    #[test]
    fn dispatch_order_weighs_priority_among_equal_ages() {
        let mut jobs = vec![
            job("job-000004", 20, Priority::High),
            job("job-000003", 10, Priority::Low),
            job("job-000002", 10, Priority::High),
            job("job-000001", 10, Priority::Medium),
            job("job-000005", 10, Priority::Medium),
        ];
        jobs.sort_by(Job::dispatch_order);
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["job-000002", "job-000001", "job-000005", "job-000003", "job-000004"]
        );
    }

    #[test]
    fn job_status_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Scheduled.can_transition_to(Scheduled));
        assert!(!Pending.can_transition_to(InFlight));
        assert!(!Scheduled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }
}
