use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("export failed: {0}")]
    Export(#[from] serde_json::Error),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
