use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection to unit {0} lost")]
    ConnectionLost(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("link timed out")]
    Timeout,

    #[error("link not connected")]
    NotConnected,
}

impl LinkError {
    /// A fault in the link itself, as opposed to a refused command.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionLost(_) | LinkError::NotConnected | LinkError::Timeout
        )
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
