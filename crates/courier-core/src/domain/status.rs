//! Job status state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job record.
///
/// Transitions:
/// - Waiting -> Active -> Succeeded
/// - Waiting -> Active -> Waiting (retry, or lease reclaimed)
/// - Waiting -> Active -> Failed (retry budget exhausted or permanent error)
///
/// Succeeded and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Can `from -> to` happen?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Waiting, Active) | (Active, Succeeded) | (Active, Waiting) | (Active, Failed)
        )
    }
}
