//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during a dispatch cycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    State(#[from] skygrid_state::StateError),

    #[error("mission error: {0}")]
    Mission(#[from] skygrid_mission::MissionError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
