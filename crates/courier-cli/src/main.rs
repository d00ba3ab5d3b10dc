use std::sync::Arc;
use std::time::Duration;

use courier_core::app::{Job, Producer, RegistryBuilder, WorkerPool};
use courier_core::config::QueueConfig;
use courier_core::domain::{JobId, QueueResult};
use courier_core::handlers::{
    CancellationMail, Deliveryman, NewDelivery, Recipient, register_notifications,
};
use courier_core::impls::{InMemoryBroker, TracingMailer};
use courier_core::ports::{BrokerStore, SystemClock, UlidGenerator};
use tracing_subscriber::EnvFilter;

/// RUST_LOG filters; COURIER_LOG_JSON=1 switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("COURIER_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn connect_broker(config: &QueueConfig) -> QueueResult<Arc<dyn BrokerStore>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let broker =
            courier_core::impls::RedisBroker::connect(url, config.key_prefix.clone()).await?;
        return Ok(Arc::new(broker));
    }

    if config.redis_url.is_some() {
        tracing::warn!("COURIER_REDIS_URL is set but redis support is not compiled in; using the in-memory broker");
    }
    tracing::info!(queue = %config.queue_name, "using in-memory broker");
    Ok(Arc::new(InMemoryBroker::new()))
}

async fn enqueue_demo_jobs(producer: &Producer) -> QueueResult<Vec<JobId>> {
    let ana = Deliveryman {
        name: "Ana".into(),
        email: "a@x.com".into(),
    };
    let beto = Recipient::new("Beto", "SP");

    let assigned = NewDelivery {
        deliveryman: ana.clone(),
        recipient: beto.clone(),
        product: "Box".into(),
    };
    let cancelled = CancellationMail {
        deliveryman: ana,
        recipient: beto,
    };

    let mut ids = Vec::new();
    ids.push(producer.enqueue_job(&assigned).await?);
    tracing::info!(content = %assigned.notification_content(), "notification logged");
    ids.push(producer.enqueue_job(&cancelled).await?);
    Ok(ids)
}

async fn wait_until_drained(broker: &dyn BrokerStore) -> QueueResult<()> {
    loop {
        if broker.counts().await?.pending() == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> QueueResult<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = QueueConfig::from_env()?;
    let broker = connect_broker(&config).await?;

    let registry = register_notifications(
        RegistryBuilder::new().expect_kinds(&[NewDelivery::KIND, CancellationMail::KIND]),
        Arc::new(TracingMailer),
    )?
    .build()?;

    let producer = Producer::new(
        broker.clone(),
        registry.clone(),
        Arc::new(UlidGenerator::new(SystemClock)),
        Arc::new(SystemClock),
        config.max_attempts,
    );
    let pool = WorkerPool::new(config, broker.clone(), registry).spawn()?;

    let ids = enqueue_demo_jobs(&producer).await?;
    tracing::info!(jobs = ids.len(), "demo jobs enqueued");

    tokio::select! {
        drained = wait_until_drained(broker.as_ref()) => drained?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
    }
    pool.shutdown_and_join().await;

    for id in ids {
        if let Some(record) = broker.get(id).await? {
            tracing::info!(job_id = %id, kind = %record.kind, status = ?record.status, attempts = record.attempts, "final status");
        }
    }
    let counts = broker.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
