//! Reaper: hands back jobs whose lease expired.
//!
//! A worker that dies mid-attempt never acks, so its job would stay `active`
//! forever. The reaper periodically asks the broker to reclaim expired
//! leases; the reclaimed attempt still counts against the retry budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::QueueResult;
use crate::ports::BrokerStore;

pub struct Reaper {
    broker: Arc<dyn BrokerStore>,
    interval: Duration,
}

impl Reaper {
    pub fn new(broker: Arc<dyn BrokerStore>, interval: Duration) -> Self {
        Self { broker, interval }
    }

    pub async fn reap_once(&self) -> QueueResult<usize> {
        let reclaimed = self.broker.reap_expired().await?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Reap every `interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::error!(error = %e, "reaper pass failed");
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    }
}
