use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("slot pool: {0}")]
    Pool(#[from] skygrid_slots::PoolError),

    #[error("registry: {0}")]
    Registry(#[from] skygrid_registry::RegistryError),

    #[error("job store: {0}")]
    State(#[from] skygrid_state::StateError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] skygrid_scheduler::SchedulerError),

    #[error("telemetry: {0}")]
    Telemetry(#[from] skygrid_telemetry::TelemetryError),

    #[error("unknown link kind: {0}")]
    UnknownLinkKind(String),

    #[error("orchestrator already started")]
    AlreadyStarted,
}

pub type ControlResult<T> = Result<T, ControlError>;
