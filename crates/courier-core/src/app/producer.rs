//! Producer: submits jobs to the broker.
//!
//! Enqueue checks the kind against the registry and serializes the payload
//! before anything touches the broker, so a rejected job leaves no record.
//! Once `enqueue` returns `Ok` the broker has durably accepted the job.

use std::sync::Arc;

use serde::Serialize;

use crate::app::registry::{HandlerRegistry, Job};
use crate::domain::{JobId, JobKind, JobRecord, QueueError, QueueResult};
use crate::ports::{BrokerStore, Clock, IdGenerator};

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn BrokerStore>,
    registry: Arc<HandlerRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn BrokerStore>,
        registry: Arc<HandlerRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            broker,
            registry,
            ids,
            clock,
            max_attempts,
        }
    }

    /// Submit `payload` under `kind`.
    ///
    /// Fails with `UnknownKind` when no handler is registered for `kind`,
    /// `Serialization` when the payload cannot be encoded, and
    /// `BrokerUnavailable` when the broker did not accept the record.
    #[tracing::instrument(skip_all, fields(kind = tracing::field::Empty, job_id = tracing::field::Empty))]
    pub async fn enqueue<P>(&self, kind: impl Into<JobKind>, payload: &P) -> QueueResult<JobId>
    where
        P: Serialize + Sync + ?Sized,
    {
        let kind = kind.into();
        let span = tracing::Span::current();
        span.record("kind", kind.as_str());

        if !self.registry.contains(&kind) {
            tracing::warn!("rejecting job of unregistered kind");
            return Err(QueueError::UnknownKind(kind));
        }
        let payload = serde_json::to_value(payload)?;

        let id = self.ids.generate_job_id();
        span.record("job_id", tracing::field::display(id));
        let record = JobRecord::new(id, kind, payload, self.max_attempts, self.clock.now());

        let id = self.broker.push(record).await?;
        tracing::debug!("job enqueued");
        Ok(id)
    }

    /// Typed form of [`enqueue`](Self::enqueue): the kind comes from `J::KIND`.
    pub async fn enqueue_job<J: Job>(&self, job: &J) -> QueueResult<JobId> {
        self.enqueue(J::kind(), job).await
    }
}
