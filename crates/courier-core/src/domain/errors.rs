//! Error taxonomy and its operational classification.

use std::time::Duration;

use thiserror::Error;

use super::ids::JobId;
use super::kind::JobKind;
use super::status::JobStatus;

/// Operational classification of an error.
///
/// - Transient: worth retrying (the side effect may succeed next time)
/// - Permanent: retrying cannot help
/// - Infrastructure: the broker itself is unhealthy or the lease is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no handler registered for job kind={0}")]
    UnknownKind(JobKind),

    #[error("duplicate handler for job kind={0}")]
    DuplicateKind(JobKind),

    #[error("expected job kinds are not registered: {0:?}")]
    MissingKinds(Vec<String>),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid payload for job kind={kind}: {reason}")]
    InvalidPayload { kind: JobKind, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("lease lost for {0}")]
    LeaseLost(JobId),

    #[error("invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Dispatch(_) | QueueError::Timeout(_) => ErrorKind::Transient,
            QueueError::BrokerUnavailable(_) | QueueError::LeaseLost(_) => {
                ErrorKind::Infrastructure
            }
            QueueError::UnknownKind(_)
            | QueueError::DuplicateKind(_)
            | QueueError::MissingKinds(_)
            | QueueError::InvalidPayload { .. }
            | QueueError::Serialization(_)
            | QueueError::JobNotFound(_)
            | QueueError::InvalidTransition { .. }
            | QueueError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// Should a handler failure with this error go back to the queue?
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }
}
