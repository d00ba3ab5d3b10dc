//! In-memory broker.
//!
//! One mutex guards the whole state, which makes every operation (claim in
//! particular) atomic. Suitable for tests, development and single-process
//! deployments; state is lost with the process.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    JobFailure, JobId, JobRecord, JobStatus, Lease, QueueError, QueueResult, WorkerId,
    deadline_after,
};
use crate::observability::QueueCounts;
use crate::ports::{BrokerStore, Clock, SystemClock};

/// Retry-delayed job, ordered so the heap pops the earliest `retry_at` first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    retry_at: DateTime<Utc>,
    id: JobId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .retry_at
            .cmp(&self.retry_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct BrokerState {
    records: HashMap<JobId, JobRecord>,

    /// Claimable job ids in FIFO order.
    ready: VecDeque<JobId>,

    /// Waiting jobs held back by a retry delay.
    scheduled: BinaryHeap<Scheduled>,
}

impl BrokerState {
    fn promote_scheduled(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.retry_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if self
                .records
                .get(&entry.id)
                .is_some_and(|r| r.status == JobStatus::Waiting)
            {
                self.ready.push_back(entry.id);
            }
        }
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> QueueResult<usize> {
        let expired: Vec<JobId> = self
            .records
            .values()
            .filter(|r| r.lease_expired(now))
            .map(|r| r.id)
            .collect();

        for id in &expired {
            let Some(record) = self.records.get_mut(id) else {
                continue;
            };
            let status = record.reclaim(now)?;
            tracing::warn!(job_id = %id, kind = %record.kind, attempts = record.attempts, ?status, "lease expired, job reclaimed");
            if status == JobStatus::Waiting {
                self.ready.push_back(*id);
            }
        }
        Ok(expired.len())
    }

    fn leased_mut(&mut self, id: JobId, worker: WorkerId) -> QueueResult<&mut JobRecord> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(QueueError::JobNotFound(id))?;
        if !record.is_leased_by(worker) {
            return Err(QueueError::LeaseLost(id));
        }
        Ok(record)
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// In-memory [`BrokerStore`]. Clones share the same state.
///
/// Finished records are kept until [`purge_finished`](Self::purge_finished)
/// drops them; a long-running process should call it periodically.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    clock: Arc<dyn Clock>,
    offline: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            clock,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an outage: while offline every operation fails with
    /// `BrokerUnavailable` and nothing changes.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    fn ensure_online(&self) -> QueueResult<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::BrokerUnavailable(
                "in-memory broker is offline".to_string(),
            ));
        }
        Ok(())
    }

    /// Permanently failed jobs, oldest first, for operator inspection.
    pub async fn failed_jobs(&self) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut failed: Vec<JobRecord> = state
            .records
            .values()
            .filter(|r| r.status == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|r| r.enqueued_at);
        failed
    }

    /// Drop succeeded and failed records that finished before `before`.
    pub async fn purge_finished(&self, before: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let len = state.records.len();
        state.records.retain(|_, r| {
            !(r.status.is_terminal() && r.finished_at.is_some_and(|at| at < before))
        });
        len - state.records.len()
    }

    /// Number of records, in any state.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerStore for InMemoryBroker {
    async fn push(&self, record: JobRecord) -> QueueResult<JobId> {
        self.ensure_online()?;
        let id = record.id;
        let mut state = self.state.lock().await;
        state.records.insert(id, record);
        state.ready.push_back(id);
        Ok(id)
    }

    async fn claim(&self, worker: WorkerId, lease_for: Duration) -> QueueResult<Option<JobRecord>> {
        self.ensure_online()?;
        let now = self.clock.now();
        let expires_at = deadline_after(now, lease_for)?;

        let mut state = self.state.lock().await;
        state.reclaim_expired(now)?;
        state.promote_scheduled(now);

        while let Some(id) = state.ready.pop_front() {
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            if !record.is_claimable(now) {
                continue;
            }
            record.start_attempt(
                Lease {
                    owner: worker,
                    expires_at,
                },
                now,
            )?;
            return Ok(Some(record.clone()));
        }
        Ok(None)
    }

    async fn ack(&self, id: JobId, worker: WorkerId) -> QueueResult<()> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.leased_mut(id, worker)?.mark_succeeded(now)
    }

    async fn requeue(
        &self,
        id: JobId,
        worker: WorkerId,
        delay: Duration,
        failure: JobFailure,
    ) -> QueueResult<()> {
        self.ensure_online()?;
        let now = self.clock.now();
        let retry_at = deadline_after(now, delay)?;
        let mut state = self.state.lock().await;
        state.leased_mut(id, worker)?.schedule_retry(retry_at, failure)?;
        if retry_at <= now {
            state.ready.push_back(id);
        } else {
            state.scheduled.push(Scheduled { retry_at, id });
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, worker: WorkerId, failure: JobFailure) -> QueueResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        state.leased_mut(id, worker)?.mark_failed(failure)
    }

    async fn reap_expired(&self) -> QueueResult<usize> {
        self.ensure_online()?;
        let now = self.clock.now();
        self.state.lock().await.reclaim_expired(now)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        self.ensure_online()?;
        Ok(self.state.lock().await.counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureReason, JobKind};
    use crate::ports::ManualClock;
    use ulid::Ulid;

    const LEASE: Duration = Duration::from_secs(30);

    fn broker() -> (InMemoryBroker, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryBroker::with_clock(Arc::new(clock.clone())), clock)
    }

    fn record(clock: &ManualClock, max_attempts: u32) -> JobRecord {
        JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            JobKind::new("NewDelivery"),
            serde_json::json!({"product": "Box"}),
            max_attempts,
            clock.now(),
        )
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(Ulid::new())
    }

    fn failure(clock: &ManualClock) -> JobFailure {
        JobFailure::new(FailureReason::Dispatch, "smtp down", clock.now())
    }

    #[tokio::test]
    async fn push_and_counts() {
        let (broker, clock) = broker();
        broker.push(record(&clock, 3)).await.unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let (broker, clock) = broker();
        let first = broker.push(record(&clock, 3)).await.unwrap();
        let second = broker.push(record(&clock, 3)).await.unwrap();

        let a = broker.claim(worker(), LEASE).await.unwrap().unwrap();
        let b = broker.claim(worker(), LEASE).await.unwrap().unwrap();
        assert_eq!(a.id, first);
        assert_eq!(b.id, second);
        assert!(broker.claim(worker(), LEASE).await.unwrap().is_none());

        assert_eq!(a.status, JobStatus::Active);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test]
    async fn ack_marks_succeeded() {
        let (broker, clock) = broker();
        let w = worker();
        let id = broker.push(record(&clock, 3)).await.unwrap();
        broker.claim(w, LEASE).await.unwrap().unwrap();
        broker.ack(id, w).await.unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn only_the_lease_holder_may_settle() {
        let (broker, clock) = broker();
        let id = broker.push(record(&clock, 3)).await.unwrap();
        broker.claim(worker(), LEASE).await.unwrap().unwrap();

        let err = broker.ack(id, worker()).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(lost) if lost == id));
        assert_eq!(broker.get(id).await.unwrap().unwrap().status, JobStatus::Active);
    }

    #[tokio::test]
    async fn requeue_with_delay_hides_job_until_due() {
        let (broker, clock) = broker();
        let w = worker();
        let id = broker.push(record(&clock, 3)).await.unwrap();
        broker.claim(w, LEASE).await.unwrap().unwrap();
        broker
            .requeue(id, w, Duration::from_secs(10), failure(&clock))
            .await
            .unwrap();

        assert!(broker.claim(worker(), LEASE).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(10));
        let again = broker.claim(worker(), LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_on_claim() {
        let (broker, clock) = broker();
        let crashed = worker();
        let id = broker.push(record(&clock, 3)).await.unwrap();
        broker.claim(crashed, LEASE).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(29));
        assert!(broker.claim(worker(), LEASE).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(1));
        let rescued = broker.claim(worker(), LEASE).await.unwrap().unwrap();
        assert_eq!(rescued.id, id);
        assert_eq!(rescued.attempts, 2);

        // The crashed worker finally reports back: too late.
        assert!(matches!(
            broker.ack(id, crashed).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn reap_fails_job_whose_last_attempt_crashed() {
        let (broker, clock) = broker();
        let id = broker.push(record(&clock, 1)).await.unwrap();
        broker.claim(worker(), LEASE).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(broker.reap_expired().await.unwrap(), 1);

        let rec = broker.get(id).await.unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.error.unwrap().reason, FailureReason::LeaseExpired);
        assert_eq!(broker.failed_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn purge_drops_only_old_finished_records() {
        let (broker, clock) = broker();
        let w = worker();
        let done = broker.push(record(&clock, 3)).await.unwrap();
        broker.claim(w, LEASE).await.unwrap().unwrap();
        broker.ack(done, w).await.unwrap();
        let pending = broker.push(record(&clock, 3)).await.unwrap();

        assert_eq!(broker.purge_finished(clock.now()).await, 0);
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(broker.purge_finished(clock.now()).await, 1);

        assert!(broker.get(done).await.unwrap().is_none());
        assert!(broker.get(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_rejects_unrepresentable_lease() {
        let (broker, clock) = broker();
        let id = broker.push(record(&clock, 3)).await.unwrap();

        let err = broker.claim(worker(), Duration::MAX).await.unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert_eq!(broker.get(id).await.unwrap().unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn offline_broker_rejects_without_mutation() {
        let (broker, clock) = broker();
        broker.set_offline(true);
        let err = broker.push(record(&clock, 3)).await.unwrap_err();
        assert!(matches!(err, QueueError::BrokerUnavailable(_)));

        broker.set_offline(false);
        assert!(broker.is_empty().await);
    }
}
