//! End-to-end queue behaviour over the in-memory broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::app::{AttemptOutcome, Handler, Job, Producer, RegistryBuilder, WorkerPool};
use courier_core::config::QueueConfig;
use courier_core::domain::{
    FailureReason, JobStatus, QueueError, QueueResult, RetryPolicy, WorkerId,
};
use courier_core::handlers::{
    CancellationMail, Deliveryman, NewDelivery, Recipient, register_notifications,
};
use courier_core::impls::{InMemoryBroker, MemoryMailer};
use courier_core::ports::{BrokerStore, ManualClock, UlidGenerator};
use courier_core::HandlerRegistry;
use ulid::Ulid;

struct Harness {
    clock: ManualClock,
    broker: InMemoryBroker,
    mailer: MemoryMailer,
    registry: Arc<HandlerRegistry>,
    producer: Producer,
    config: QueueConfig,
}

impl Harness {
    fn new(max_attempts: u32) -> Self {
        Self::with_registry(max_attempts, RegistryBuilder::new())
    }

    fn with_registry(max_attempts: u32, builder: RegistryBuilder) -> Self {
        let clock = ManualClock::default();
        let broker = InMemoryBroker::with_clock(Arc::new(clock.clone()));
        let mailer = MemoryMailer::new();
        let registry = register_notifications(builder, Arc::new(mailer.clone()))
            .unwrap()
            .build()
            .unwrap();
        let config = QueueConfig::default()
            .with_max_attempts(max_attempts)
            .with_retry_policy(&RetryPolicy::immediate())
            .with_poll_interval(Duration::from_millis(5), Duration::from_millis(20));
        let producer = Producer::new(
            Arc::new(broker.clone()),
            registry.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(clock.clone()),
            max_attempts,
        );
        Self {
            clock,
            broker,
            mailer,
            registry,
            producer,
            config,
        }
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.config.clone(),
            Arc::new(self.broker.clone()),
            self.registry.clone(),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }
}

fn new_delivery() -> NewDelivery {
    NewDelivery {
        deliveryman: Deliveryman {
            name: "Ana".into(),
            email: "a@x.com".into(),
        },
        recipient: Recipient::new("Beto", "SP"),
        product: "Box".into(),
    }
}

#[tokio::test]
async fn new_delivery_reaches_the_mailer_with_the_exact_payload() {
    let h = Harness::new(3);
    let payload = serde_json::json!({
        "deliveryman": {"name": "Ana", "email": "a@x.com"},
        "recipient": {"nome": "Beto", "cidade": "SP"},
        "product": "Box"
    });
    let id = h.producer.enqueue("NewDelivery", &payload).await.unwrap();

    let worker = h.pool().worker();
    assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));

    let record = h.broker.get(id).await.unwrap().unwrap();
    assert_eq!(record.payload(), &payload);
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempts, 1);

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "Ana <a@x.com>");
    assert_eq!(sent[0].context["recipientName"], "Beto");
    assert_eq!(sent[0].context["city"], "SP");
    assert_eq!(sent[0].context["product"], "Box");
}

#[tokio::test]
async fn stored_recipient_row_is_mailed_as_is() {
    let h = Harness::new(3);
    let payload = serde_json::json!({
        "deliveryman": {"id": 7, "name": "Ana", "email": "a@x.com", "avatar_id": null},
        "recipient": {
            "id": 2, "nome": "Beto", "rua": "Rua A", "numero": 10,
            "cidade": "SP", "cep": "13000-000"
        },
        "product": "Box"
    });
    h.producer.enqueue("NewDelivery", &payload).await.unwrap();

    let worker = h.pool().worker();
    assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].context["recipientName"], "Beto");
    assert_eq!(sent[0].context["city"], "SP");
}

#[tokio::test]
async fn unknown_kind_is_rejected_before_the_broker() {
    let h = Harness::new(3);
    let err = h
        .producer
        .enqueue("SmsReminder", &serde_json::json!({"to": "+55"}))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::UnknownKind(_)));
    assert!(h.broker.is_empty().await);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let h = Harness::new(3);
    h.mailer.fail_next(2);
    let id = h.producer.enqueue_job(&new_delivery()).await.unwrap();

    let worker = h.pool().worker();
    while worker.run_once().await.unwrap().is_some() {}

    let record = h.broker.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempts, 3);
    assert_eq!(h.mailer.attempts(), 3);
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn persistent_failure_ends_failed_after_max_attempts() {
    let h = Harness::new(3);
    h.mailer
        .fail_always(courier_core::ports::MailError::Transport("smtp down".into()));
    let id = h.producer.enqueue_job(&new_delivery()).await.unwrap();

    let worker = h.pool().worker();
    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.run_once().await.unwrap() {
        outcomes.push(outcome);
    }

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.last(), Some(&AttemptOutcome::Failed));

    let record = h.broker.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.error.as_ref().unwrap().reason, FailureReason::Dispatch);
    assert_eq!(h.mailer.attempts(), 3);
    assert_eq!(h.broker.failed_jobs().await.len(), 1);
}

#[tokio::test]
async fn retry_delay_defers_redelivery() {
    let mut h = Harness::new(3);
    h.config = h.config.clone().with_retry_policy(&RetryPolicy {
        base_delay: Duration::from_secs(10),
        multiplier: 2.0,
        max_delay: Duration::from_secs(60),
        jitter: 0.0,
    });
    h.mailer.fail_next(1);
    let id = h.producer.enqueue_job(&new_delivery()).await.unwrap();
    let worker = h.pool().worker();

    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(AttemptOutcome::Retried {
            delay: Duration::from_secs(10)
        })
    );
    assert_eq!(worker.run_once().await.unwrap(), None);

    h.clock.advance(chrono::Duration::seconds(10));
    assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));
    assert_eq!(h.broker.get(id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_exclusive() {
    let h = Harness::new(3);
    for _ in 0..50 {
        h.producer.enqueue_job(&new_delivery()).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let broker = h.broker.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::from_ulid(Ulid::new());
            let mut claimed = Vec::new();
            while let Some(record) = broker.claim(worker, Duration::from_secs(60)).await.unwrap() {
                claimed.push(record.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for id in task.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 50);
    assert_eq!(h.broker.counts().await.unwrap().active, 50);
}

#[tokio::test]
async fn crashed_worker_job_is_reclaimed_and_retried() {
    let h = Harness::new(3);
    let id = h.producer.enqueue_job(&new_delivery()).await.unwrap();

    // A worker claims and dies without settling.
    let crashed = WorkerId::from_ulid(Ulid::new());
    h.broker
        .claim(crashed, h.config.lease_duration)
        .await
        .unwrap()
        .unwrap();

    let worker = h.pool().worker();
    assert_eq!(worker.run_once().await.unwrap(), None);

    h.clock.advance(chrono::Duration::from_std(h.config.lease_duration).unwrap());
    assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));

    let record = h.broker.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.attempts, 2);
    assert_eq!(h.mailer.sent().len(), 1);

    assert!(matches!(
        h.broker.ack(id, crashed).await,
        Err(QueueError::LeaseLost(_))
    ));
}

#[tokio::test]
async fn broker_outage_is_reported_not_swallowed() {
    let h = Harness::new(3);
    h.producer.enqueue_job(&new_delivery()).await.unwrap();
    h.broker.set_offline(true);

    let err = h
        .producer
        .enqueue_job(&new_delivery())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::BrokerUnavailable(_)));

    let worker = h.pool().worker();
    assert!(matches!(
        worker.run_once().await,
        Err(QueueError::BrokerUnavailable(_))
    ));

    h.broker.set_offline(false);
    assert_eq!(h.broker.counts().await.unwrap().waiting, 1);
    assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));
}

#[derive(Debug, Serialize, Deserialize)]
struct SlowJob {
    millis: u64,
}

impl Job for SlowJob {
    const KIND: &'static str = "SlowJob";
}

#[derive(Clone, Default)]
struct SlowHandler {
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<SlowJob> for SlowHandler {
    async fn handle(&self, job: SlowJob) -> QueueResult<()> {
        tokio::time::sleep(Duration::from_millis(job.millis)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_finishes_in_flight_jobs_and_leaves_the_rest_waiting() {
    let slow = SlowHandler::default();
    let builder = RegistryBuilder::new()
        .register::<SlowJob, _>(slow.clone())
        .unwrap();
    let mut h = Harness::with_registry(3, builder);
    h.config = h.config.clone().with_concurrency(1);

    let first = h.producer.enqueue_job(&SlowJob { millis: 200 }).await.unwrap();
    h.producer.enqueue_job(&SlowJob { millis: 1 }).await.unwrap();
    h.producer.enqueue_job(&SlowJob { millis: 1 }).await.unwrap();

    let handle = h.pool().spawn().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.broker.counts().await.unwrap().active == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    handle.shutdown_and_join().await;

    assert_eq!(slow.finished.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.broker.get(first).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );
    let counts = h.broker.counts().await.unwrap();
    assert_eq!(counts.succeeded, 1);
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
async fn pool_drains_mixed_notification_kinds() {
    let h = Harness::new(3);
    h.mailer.fail_next(1);
    h.producer.enqueue_job(&new_delivery()).await.unwrap();
    h.producer
        .enqueue_job(&CancellationMail {
            deliveryman: new_delivery().deliveryman,
            recipient: new_delivery().recipient,
        })
        .await
        .unwrap();

    let handle = h.pool().spawn().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.broker.counts().await.unwrap().succeeded < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    handle.shutdown_and_join().await;

    let mut subjects: Vec<String> = h.mailer.sent().into_iter().map(|m| m.subject).collect();
    subjects.sort();
    assert_eq!(subjects, vec![CancellationMail::SUBJECT, NewDelivery::SUBJECT]);
}
