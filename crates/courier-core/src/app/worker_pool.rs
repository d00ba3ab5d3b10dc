//! Worker pool: claim -> resolve -> handle -> ack / requeue / fail.
//!
//! Each slot processes one job at a time, so at most `concurrency` handlers
//! run at once. Slots poll the broker and back off while the queue is empty.
//!
//! Shutdown stops new claims; a job already claimed runs to completion (or to
//! its timeout) and is settled before the slot exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app::reaper::Reaper;
use crate::app::registry::HandlerRegistry;
use crate::config::QueueConfig;
use crate::domain::{
    Decision, JobFailure, JobRecord, QueueError, QueueResult, RetryPolicy, WorkerId,
};
use crate::ports::{BrokerStore, Clock, IdGenerator, SystemClock, UlidGenerator};

/// What one processed claim turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded,
    Retried { delay: Duration },
    Failed,
}

/// A single worker slot.
pub struct Worker {
    id: WorkerId,
    broker: Arc<dyn BrokerStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    handler_timeout: Duration,
    lease_duration: Duration,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Claim and process at most one job. `Ok(None)` when nothing was claimable.
    ///
    /// Broker errors while claiming or settling are returned; the job itself
    /// is then left to lease expiry.
    pub async fn run_once(&self) -> QueueResult<Option<AttemptOutcome>> {
        let Some(record) = self.broker.claim(self.id, self.lease_duration).await? else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "job",
            job_id = %record.id,
            kind = %record.kind,
            attempt = record.attempts,
            max_attempts = record.max_attempts,
        );
        self.process(record).instrument(span).await.map(Some)
    }

    async fn process(&self, record: JobRecord) -> QueueResult<AttemptOutcome> {
        tracing::debug!(worker = %self.id, "job claimed");
        match self.execute(&record).await {
            Ok(()) => {
                self.broker.ack(record.id, self.id).await?;
                tracing::info!("job succeeded");
                Ok(AttemptOutcome::Succeeded)
            }
            Err(err) => self.settle_failure(&record, err).await,
        }
    }

    /// Run the handler in its own task, bounded by the handler timeout.
    async fn execute(&self, record: &JobRecord) -> QueueResult<()> {
        let handler = self.registry.resolve(&record.kind)?;
        let payload = record.payload().clone();

        let mut task = tokio::spawn(async move { handler.handle_dyn(&payload).await });
        match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(QueueError::Dispatch("handler panicked".to_string()))
            }
            Ok(Err(join_err)) => Err(QueueError::Dispatch(join_err.to_string())),
            Err(_) => {
                task.abort();
                Err(QueueError::Timeout(self.handler_timeout))
            }
        }
    }

    async fn settle_failure(
        &self,
        record: &JobRecord,
        err: QueueError,
    ) -> QueueResult<AttemptOutcome> {
        let failure = JobFailure::from_error(&err, self.clock.now());

        match self
            .policy
            .decide_after(&err, record.attempts, record.max_attempts)
        {
            Decision::Retry { delay } => {
                let delay = self.policy.jittered(delay, &mut rand::thread_rng());
                self.broker
                    .requeue(record.id, self.id, delay, failure)
                    .await?;
                tracing::warn!(error = %err, ?delay, "attempt failed, retrying");
                Ok(AttemptOutcome::Retried { delay })
            }
            Decision::Fail { reason } => {
                self.broker.fail(record.id, self.id, failure).await?;
                tracing::error!(error = %err, %reason, payload = %record.payload(), "job failed permanently");
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    /// Process jobs until shutdown is signalled.
    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
        max_poll_interval: Duration,
    ) {
        tracing::debug!(worker = %self.id, "worker started");
        let mut idle = poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => {
                    idle = poll_interval;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "worker iteration failed");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
            idle = (idle * 2).min(max_poll_interval);
        }
        tracing::debug!(worker = %self.id, "worker stopped");
    }
}

/// Wires workers and the reaper to a broker and a registry.
pub struct WorkerPool {
    config: QueueConfig,
    broker: Arc<dyn BrokerStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl WorkerPool {
    pub fn new(
        config: QueueConfig,
        broker: Arc<dyn BrokerStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config,
            broker,
            registry,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Use `clock` for failure timestamps and worker ids.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(clock.clone()));
        self.clock = clock;
        self
    }

    /// A standalone worker sharing this pool's wiring.
    pub fn worker(&self) -> Worker {
        Worker {
            id: self.ids.generate_worker_id(),
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            policy: self.config.retry_policy(),
            handler_timeout: self.config.handler_timeout,
            lease_duration: self.config.lease_duration,
        }
    }

    /// Validate the configuration and start `concurrency` workers plus the reaper.
    pub fn spawn(self) -> QueueResult<WorkerPoolHandle> {
        self.config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(self.config.concurrency + 1);
        let mut worker_ids = Vec::with_capacity(self.config.concurrency);
        for _ in 0..self.config.concurrency {
            let worker = self.worker();
            worker_ids.push(worker.id());
            let rx = shutdown_rx.clone();
            let (poll, max_poll) = (self.config.poll_interval, self.config.max_poll_interval);
            joins.push(tokio::spawn(worker.run(rx, poll, max_poll)));
        }

        let reaper = Reaper::new(self.broker.clone(), self.config.reap_interval);
        joins.push(tokio::spawn(reaper.run(shutdown_rx)));

        tracing::info!(
            queue = %self.config.queue_name,
            concurrency = self.config.concurrency,
            kinds = ?self.registry.kinds(),
            "worker pool started"
        );
        Ok(WorkerPoolHandle {
            shutdown_tx,
            joins,
            worker_ids,
        })
    }
}

/// Handle to a running pool. Dropping it also stops the workers.
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    worker_ids: Vec<WorkerId>,
}

impl WorkerPoolHandle {
    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Stop claiming new jobs. In-flight jobs still finish.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Request shutdown and wait for every worker to settle its current job.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}
