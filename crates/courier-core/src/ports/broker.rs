//! BrokerStore port: durable storage with queue semantics.
//!
//! The broker, not any in-process structure, is authoritative for job
//! existence and status. Every method is one atomic step against the store:
//!
//! - `claim` is exclusive: two workers never receive the same record.
//! - a claimed record stays hidden until its lease expires; `reap_expired`
//!   (and, where cheap, `claim` itself) hands expired jobs back.
//! - `ack`/`requeue`/`fail` only succeed for the worker holding the lease;
//!   anyone else gets `LeaseLost` and nothing changes.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{JobFailure, JobId, JobRecord, QueueResult, WorkerId};
use crate::observability::QueueCounts;

#[async_trait]
pub trait BrokerStore: Send + Sync {
    /// Durably append a new `waiting` record. Returns once the store accepted it.
    async fn push(&self, record: JobRecord) -> QueueResult<JobId>;

    /// Claim the oldest claimable job for `worker`, leased for `lease_for`.
    ///
    /// The returned record is already `active` with `attempts` incremented.
    /// `Ok(None)` means nothing is claimable right now.
    async fn claim(&self, worker: WorkerId, lease_for: Duration) -> QueueResult<Option<JobRecord>>;

    /// Active -> Succeeded.
    async fn ack(&self, id: JobId, worker: WorkerId) -> QueueResult<()>;

    /// Active -> Waiting, claimable again after `delay`.
    async fn requeue(
        &self,
        id: JobId,
        worker: WorkerId,
        delay: Duration,
        failure: JobFailure,
    ) -> QueueResult<()>;

    /// Active -> Failed, permanently.
    async fn fail(&self, id: JobId, worker: WorkerId, failure: JobFailure) -> QueueResult<()>;

    /// Hand back every job whose lease expired. Returns how many were reclaimed.
    async fn reap_expired(&self) -> QueueResult<usize>;

    async fn get(&self, id: JobId) -> QueueResult<Option<JobRecord>>;

    async fn counts(&self) -> QueueResult<QueueCounts>;
}
