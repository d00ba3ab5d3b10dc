//! Job record: the unit of deferred work tracked by the broker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{QueueError, QueueResult};
use super::ids::{JobId, WorkerId};
use super::kind::JobKind;
use super::status::JobStatus;

/// Exclusive claim on an active job.
///
/// Until `expires_at` no other worker may claim the job. Past it, the broker
/// may hand the job back to `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// `now + after`, or a `Config` error when the result is not representable.
pub fn deadline_after(now: DateTime<Utc>, after: Duration) -> QueueResult<DateTime<Utc>> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| now.checked_add_signed(after))
        .ok_or_else(|| QueueError::Config(format!("duration out of range: {after:?}")))
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownKind,
    InvalidPayload,
    Dispatch,
    Timeout,
    LeaseExpired,
}

impl FailureReason {
    pub fn from_error(error: &QueueError) -> Self {
        match error {
            QueueError::UnknownKind(_) => FailureReason::UnknownKind,
            QueueError::InvalidPayload { .. } | QueueError::Serialization(_) => {
                FailureReason::InvalidPayload
            }
            QueueError::Timeout(_) => FailureReason::Timeout,
            _ => FailureReason::Dispatch,
        }
    }
}

/// Last failure detail recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            reason,
            message: message.into(),
            at,
        }
    }

    pub fn from_error(error: &QueueError, at: DateTime<Utc>) -> Self {
        Self::new(FailureReason::from_error(error), error.to_string(), at)
    }
}

/// The single source of truth for one job.
///
/// The payload is private: once enqueued it can only be read.
/// All status changes go through the methods below, which refuse to leave a
/// terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    payload: serde_json::Value,
    pub status: JobStatus,

    /// Execution attempts so far, including the current one while active.
    pub attempts: u32,
    pub max_attempts: u32,

    pub enqueued_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,

    /// Earliest time a waiting job may be claimed again (retry backoff).
    pub retry_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub error: Option<JobFailure>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        kind: JobKind,
        payload: serde_json::Value,
        max_attempts: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts,
            enqueued_at,
            last_attempted_at: None,
            retry_at: None,
            lease: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Waiting and not held back by a retry delay.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Active with a lease that ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lease.is_some_and(|l| l.is_expired(now))
    }

    /// Does `worker` currently hold the lease?
    pub fn is_leased_by(&self, worker: WorkerId) -> bool {
        self.status == JobStatus::Active && self.lease.is_some_and(|l| l.owner == worker)
    }

    fn transition(&mut self, to: JobStatus) -> QueueResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Waiting -> Active. Increments `attempts` and takes the lease.
    pub fn start_attempt(&mut self, lease: Lease, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(JobStatus::Active)?;
        self.attempts += 1;
        self.last_attempted_at = Some(now);
        self.retry_at = None;
        self.lease = Some(lease);
        Ok(())
    }

    /// Active -> Succeeded.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(JobStatus::Succeeded)?;
        self.lease = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Active -> Waiting, claimable again from `retry_at`.
    pub fn schedule_retry(&mut self, retry_at: DateTime<Utc>, failure: JobFailure) -> QueueResult<()> {
        self.transition(JobStatus::Waiting)?;
        self.lease = None;
        self.retry_at = Some(retry_at);
        self.error = Some(failure);
        Ok(())
    }

    /// Active -> Failed.
    pub fn mark_failed(&mut self, failure: JobFailure) -> QueueResult<()> {
        self.transition(JobStatus::Failed)?;
        self.lease = None;
        self.finished_at = Some(failure.at);
        self.error = Some(failure);
        Ok(())
    }

    /// Hand back a job whose lease expired.
    ///
    /// A crashed attempt still counts against the budget: when it was the
    /// last one, the job fails instead of going back to `waiting`.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> QueueResult<JobStatus> {
        let owner = self
            .lease
            .map(|l| l.owner.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let failure = JobFailure::new(
            FailureReason::LeaseExpired,
            format!("lease held by {owner} expired"),
            now,
        );
        if self.attempts >= self.max_attempts {
            self.mark_failed(failure)?;
        } else {
            self.schedule_retry(now, failure)?;
        }
        Ok(self.status)
    }
}
