//! MailDispatch port: the external mail-delivery collaborator.
//!
//! Rendering and SMTP live behind this trait. Handlers build a
//! [`MailMessage`] and treat any error as a failed attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::QueueError;

/// `send(to, subject, template, context)` as one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    /// `"Name <address>"`.
    pub to: String,
    pub subject: String,
    /// Template identifier understood by the dispatcher.
    pub template: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl MailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            template: template.into(),
            context: serde_json::Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum MailError {
    #[error("mail rejected: {0}")]
    Rejected(String),

    #[error("mail transport error: {0}")]
    Transport(String),
}

impl From<MailError> for QueueError {
    fn from(err: MailError) -> Self {
        QueueError::Dispatch(err.to_string())
    }
}

#[async_trait]
pub trait MailDispatch: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}
