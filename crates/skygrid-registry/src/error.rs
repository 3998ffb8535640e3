use thiserror::Error;

use crate::status::UnitStatus;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("unit already registered: {0}")]
    AlreadyRegistered(String),

    #[error("unit {unit}: illegal transition {from} -> {to}")]
    InvalidTransition {
        unit: String,
        from: UnitStatus,
        to: UnitStatus,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;
