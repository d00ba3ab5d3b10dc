use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier selecting which handler processes a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}
