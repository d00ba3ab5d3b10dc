//! Queue configuration.
//!
//! Defaults work for a local run; every field can be overridden through a
//! `COURIER_*` environment variable (see [`QueueConfig::from_env`]).

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;

use crate::domain::{QueueError, QueueResult, RetryPolicy, deadline_after};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Logical queue name.
    pub queue_name: String,

    /// Key prefix for the Redis broker.
    pub key_prefix: String,

    /// Redis connection URL. `None` selects the in-memory broker.
    pub redis_url: Option<String>,

    /// Number of worker slots.
    pub concurrency: usize,

    /// Attempts allowed per job, the first one included.
    pub max_attempts: u32,

    pub handler_timeout: Duration,

    /// How long a claim stays exclusive. Must exceed `handler_timeout`.
    pub lease_duration: Duration,

    /// Idle poll interval; doubles on every empty claim up to `max_poll_interval`.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,

    /// How often the reaper looks for expired leases.
    pub reap_interval: Duration,

    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_max_delay: Duration,
    pub retry_jitter: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("mail")
    }
}

impl QueueConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            key_prefix: format!("courier:queue:{queue_name}"),
            queue_name,
            redis_url: None,
            concurrency: 4,
            max_attempts: 3,
            handler_timeout: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(5),
            retry_base_delay: Duration::from_secs(1),
            retry_multiplier: 2.0,
            retry_max_delay: Duration::from_secs(300),
            retry_jitter: 0.0,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_interval = min;
        self.max_poll_interval = max;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: &RetryPolicy) -> Self {
        self.retry_base_delay = policy.base_delay;
        self.retry_multiplier = policy.multiplier;
        self.retry_max_delay = policy.max_delay;
        self.retry_jitter = policy.jitter;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            multiplier: self.retry_multiplier,
            max_delay: self.retry_max_delay,
            jitter: self.retry_jitter,
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.is_empty() {
            return Err(QueueError::Config("queue name must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::Config("max_attempts must be at least 1".into()));
        }
        if self.handler_timeout.is_zero() {
            return Err(QueueError::Config("handler timeout must be positive".into()));
        }
        if self.lease_duration <= self.handler_timeout {
            return Err(QueueError::Config(format!(
                "lease duration ({:?}) must exceed handler timeout ({:?})",
                self.lease_duration, self.handler_timeout
            )));
        }
        if self.poll_interval.is_zero() || self.poll_interval > self.max_poll_interval {
            return Err(QueueError::Config(
                "poll interval must be positive and not exceed max poll interval".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(QueueError::Config("reap interval must be positive".into()));
        }
        if self.retry_multiplier.is_nan() || self.retry_multiplier < 1.0 {
            return Err(QueueError::Config("retry multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(QueueError::Config("retry jitter must be within 0.0..=1.0".into()));
        }
        // Leases and retries become timestamps; full jitter can double a delay.
        let now = Utc::now();
        deadline_after(now, self.lease_duration)?;
        deadline_after(now, self.retry_max_delay.saturating_mul(2))?;
        Ok(())
    }

    /// Defaults overridden by `COURIER_*` environment variables, validated.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `COURIER_QUEUE` | queue_name (also derives key_prefix) |
    /// | `COURIER_KEY_PREFIX` | key_prefix |
    /// | `COURIER_REDIS_URL` | redis_url |
    /// | `COURIER_CONCURRENCY` | concurrency |
    /// | `COURIER_MAX_ATTEMPTS` | max_attempts |
    /// | `COURIER_HANDLER_TIMEOUT_MS` | handler_timeout |
    /// | `COURIER_LEASE_MS` | lease_duration |
    /// | `COURIER_POLL_MS` / `COURIER_MAX_POLL_MS` | poll_interval / max_poll_interval |
    /// | `COURIER_REAP_MS` | reap_interval |
    /// | `COURIER_RETRY_BASE_MS` / `COURIER_RETRY_MAX_MS` | retry delays |
    /// | `COURIER_RETRY_MULTIPLIER` / `COURIER_RETRY_JITTER` | retry shape |
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("COURIER_QUEUE") {
            Some(name) => Self::new(name),
            None => Self::default(),
        };

        if let Some(prefix) = lookup("COURIER_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(url) = lookup("COURIER_REDIS_URL").filter(|u| !u.is_empty()) {
            config.redis_url = Some(url);
        }

        let env = Lookup(&lookup);
        if let Some(v) = env.parse("COURIER_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = env.parse("COURIER_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = env.millis("COURIER_HANDLER_TIMEOUT_MS")? {
            config.handler_timeout = v;
        }
        if let Some(v) = env.millis("COURIER_LEASE_MS")? {
            config.lease_duration = v;
        }
        if let Some(v) = env.millis("COURIER_POLL_MS")? {
            config.poll_interval = v;
        }
        if let Some(v) = env.millis("COURIER_MAX_POLL_MS")? {
            config.max_poll_interval = v;
        }
        if let Some(v) = env.millis("COURIER_REAP_MS")? {
            config.reap_interval = v;
        }
        if let Some(v) = env.millis("COURIER_RETRY_BASE_MS")? {
            config.retry_base_delay = v;
        }
        if let Some(v) = env.parse("COURIER_RETRY_MULTIPLIER")? {
            config.retry_multiplier = v;
        }
        if let Some(v) = env.millis("COURIER_RETRY_MAX_MS")? {
            config.retry_max_delay = v;
        }
        if let Some(v) = env.parse("COURIER_RETRY_JITTER")? {
            config.retry_jitter = v;
        }

        config.validate()?;
        Ok(config)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str) -> QueueResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.0)(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|e| QueueError::Config(format!("{key}={raw:?}: {e}")))
    }

    fn millis(&self, key: &str) -> QueueResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        config.validate().unwrap();
        assert_eq!(config.key_prefix, "courier:queue:mail");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("COURIER_QUEUE", "notifications"),
            ("COURIER_CONCURRENCY", "8"),
            ("COURIER_MAX_ATTEMPTS", "5"),
            ("COURIER_HANDLER_TIMEOUT_MS", "2000"),
            ("COURIER_LEASE_MS", "5000"),
            ("COURIER_RETRY_JITTER", "0.25"),
        ]))
        .unwrap();

        assert_eq!(config.queue_name, "notifications");
        assert_eq!(config.key_prefix, "courier:queue:notifications");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.handler_timeout, Duration::from_secs(2));
        assert_eq!(config.lease_duration, Duration::from_secs(5));
        assert_eq!(config.retry_jitter, 0.25);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = QueueConfig::from_lookup(lookup(&[("COURIER_CONCURRENCY", "many")])).unwrap_err();
        assert!(matches!(err, QueueError::Config(ref m) if m.contains("COURIER_CONCURRENCY")));
    }

    #[rstest]
    #[case::zero_concurrency(QueueConfig::default().with_concurrency(0))]
    #[case::zero_attempts(QueueConfig::default().with_max_attempts(0))]
    #[case::lease_not_longer_than_timeout(
        QueueConfig::default()
            .with_handler_timeout(Duration::from_secs(10))
            .with_lease_duration(Duration::from_secs(10))
    )]
    #[case::poll_above_max(
        QueueConfig::default().with_poll_interval(Duration::from_secs(2), Duration::from_secs(1))
    )]
    #[case::jitter_out_of_range(QueueConfig { retry_jitter: 1.5, ..QueueConfig::default() })]
    #[case::shrinking_multiplier(QueueConfig { retry_multiplier: 0.5, ..QueueConfig::default() })]
    #[case::lease_past_the_calendar(
        QueueConfig::default().with_lease_duration(Duration::from_millis(i64::MAX as u64 / 2))
    )]
    #[case::retry_cap_past_the_calendar(
        QueueConfig { retry_max_delay: Duration::from_millis(i64::MAX as u64 / 2), ..QueueConfig::default() }
    )]
    fn invalid_configs_are_rejected(#[case] config: QueueConfig) {
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }
}
