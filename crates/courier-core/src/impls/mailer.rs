//! MailDispatch implementations that need no SMTP server.
//!
//! - [`MemoryMailer`] records what was sent and can be told to fail, for tests.
//! - [`TracingMailer`] logs each message, for local runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::ports::{MailDispatch, MailError, MailMessage};

#[derive(Default)]
struct Outbox {
    sent: Vec<MailMessage>,

    /// Queued failures, consumed one per `send` before anything is recorded.
    failures: VecDeque<MailError>,
    fail_always: Option<MailError>,
    attempts: usize,
}

/// Records delivered messages. Clones share the same outbox.
#[derive(Clone, Default)]
pub struct MemoryMailer {
    outbox: Arc<Mutex<Outbox>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transport error, then deliver again.
    pub fn fail_next(&self, n: usize) {
        let mut outbox = self.lock();
        for i in 0..n {
            outbox
                .failures
                .push_back(MailError::Transport(format!("injected failure #{}", i + 1)));
        }
    }

    /// Fail every send with `error` until [`recover`](Self::recover) is called.
    pub fn fail_always(&self, error: MailError) {
        self.lock().fail_always = Some(error);
    }

    pub fn recover(&self) {
        let mut outbox = self.lock();
        outbox.fail_always = None;
        outbox.failures.clear();
    }

    /// Successfully delivered messages, in order.
    pub fn sent(&self) -> Vec<MailMessage> {
        self.lock().sent.clone()
    }

    /// Every call to `send`, failed or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MailDispatch for MemoryMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let mut outbox = self.lock();
        outbox.attempts += 1;
        if let Some(err) = outbox.fail_always.clone() {
            return Err(err);
        }
        if let Some(err) = outbox.failures.pop_front() {
            return Err(err);
        }
        outbox.sent.push(message.clone());
        Ok(())
    }
}

/// Logs the message instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMailer;

#[async_trait]
impl MailDispatch for TracingMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let context = serde_json::Value::Object(message.context.clone());
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            template = %message.template,
            %context,
            "mail sent"
        );
        Ok(())
    }
}
