use sky_core::ValidationError;
use skygrid_link::LinkError;
use skygrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("invalid task: {0}")]
    Validation(#[from] ValidationError),

    #[error("no unit available")]
    NoUnitAvailable,

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {0} already has a running task")]
    AlreadyRunning(String),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("job store error: {0}")]
    State(#[from] StateError),
}

impl MissionError {
    /// Rejections the scheduler should retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MissionError::NoUnitAvailable)
    }
}

pub type MissionResult<T> = Result<T, MissionError>;
