use serde::{Deserialize, Serialize};

/// Number of records per status in a broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Jobs that still need work.
    pub fn pending(&self) -> usize {
        self.waiting + self.active
    }

    pub fn total(&self) -> usize {
        self.waiting + self.active + self.succeeded + self.failed
    }
}
