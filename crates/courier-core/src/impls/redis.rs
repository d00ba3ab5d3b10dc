//! Redis-backed broker.
//!
//! Key layout under `<prefix>`:
//!
//! - `<prefix>:job:<id>`   JSON-encoded [`JobRecord`]
//! - `<prefix>:waiting`    list of claimable ids, FIFO
//! - `<prefix>:delayed`    sorted set, score = retry_at (ms)
//! - `<prefix>:active`     sorted set, score = lease expiry (ms)
//! - `<prefix>:leases`     hash id -> lease owner
//! - `<prefix>:failed`     list of failed ids
//! - `<prefix>:succeeded`  counter
//!
//! Queue moves run as Lua scripts, so claim is exclusive across processes and
//! a settle only lands while the caller still owns the lease. Record JSON is
//! read-modify-written by the lease holder; the script checks ownership at
//! write time.
//!
//! Claim moves the id to `active` first and writes the active record second,
//! the write again guarded by lease ownership. An id left in `active` with a still-waiting record (the claimer died in
//! between) is returned to `waiting` by the reaper once its lease score
//! passes, without counting an attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use crate::domain::{
    JobFailure, JobId, JobRecord, JobStatus, Lease, QueueError, QueueResult, WorkerId,
    deadline_after,
};
use crate::observability::QueueCounts;
use crate::ports::{BrokerStore, Clock, SystemClock};

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('RPUSH', KEYS[1], id)
end
local id = redis.call('LPOP', KEYS[1])
if not id then
    return false
end
redis.call('ZADD', KEYS[3], ARGV[2], id)
redis.call('HSET', KEYS[4], id, ARGV[3])
return id
"#;

const ACTIVATE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

const SETTLE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
    return 0
end
if ARGV[6] ~= '' then
    local expiry = redis.call('ZSCORE', KEYS[2], ARGV[1])
    if not expiry or tonumber(expiry) > tonumber(ARGV[6]) then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
if ARGV[4] == 'delayed' then
    redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
elseif ARGV[4] == 'succeeded' then
    redis.call('INCR', KEYS[4])
else
    redis.call('RPUSH', KEYS[4], ARGV[1])
end
return 1
"#;

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::BrokerUnavailable(err.to_string())
    }
}

/// Where a settled job goes.
enum Target {
    Waiting,
    Delayed(DateTime<Utc>),
    Failed,
    Succeeded,
}

#[derive(Clone)]
pub struct RedisBroker {
    connection: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    claim_script: Script,
    activate_script: Script,
    settle_script: Script,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> QueueResult<Self> {
        Self::connect_with_clock(redis_url, key_prefix, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        redis_url: &str,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        let key_prefix = key_prefix.into();
        let client =
            Client::open(redis_url).map_err(|e| QueueError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!(%key_prefix, "redis broker connected");

        Ok(Self {
            connection,
            key_prefix,
            clock,
            claim_script: Script::new(CLAIM_SCRIPT),
            activate_script: Script::new(ACTIVATE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    fn job_key(&self, id: JobId) -> String {
        self.key(&format!("job:{id}"))
    }

    async fn load(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.job_key(id)).await?;
        json.map(|j| serde_json::from_str(&j).map_err(QueueError::from))
            .transpose()
    }

    async fn load_leased(&self, id: JobId, worker: WorkerId) -> QueueResult<JobRecord> {
        let record = self.load(id).await?.ok_or(QueueError::JobNotFound(id))?;
        if !record.is_leased_by(worker) {
            return Err(QueueError::LeaseLost(id));
        }
        Ok(record)
    }

    /// Write `record` and move it to `target`, provided `owner` still holds
    /// the lease (and, with `deadline`, that the lease expired by then).
    async fn settle(
        &self,
        record: &JobRecord,
        owner: WorkerId,
        target: Target,
        deadline: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let (mode, target_key, score) = match target {
            Target::Waiting => ("waiting", self.key("waiting"), 0),
            Target::Delayed(at) => ("delayed", self.key("delayed"), at.timestamp_millis()),
            Target::Failed => ("failed", self.key("failed"), 0),
            Target::Succeeded => ("succeeded", self.key("succeeded"), 0),
        };
        let deadline = deadline
            .map(|d| d.timestamp_millis().to_string())
            .unwrap_or_default();

        let mut conn = self.connection.clone();
        let landed: i32 = self
            .settle_script
            .key(self.job_key(record.id))
            .key(self.key("active"))
            .key(self.key("leases"))
            .key(target_key)
            .arg(record.id.to_string())
            .arg(owner.to_string())
            .arg(serde_json::to_string(record)?)
            .arg(mode)
            .arg(score)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;
        Ok(landed == 1)
    }

    async fn settle_leased(
        &self,
        record: &JobRecord,
        worker: WorkerId,
        target: Target,
    ) -> QueueResult<()> {
        if self.settle(record, worker, target, None).await? {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(record.id))
        }
    }
}

#[async_trait]
impl BrokerStore for RedisBroker {
    async fn push(&self, record: JobRecord) -> QueueResult<JobId> {
        let id = record.id;
        let json = serde_json::to_string(&record)?;

        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(id), json)
            .ignore()
            .rpush(self.key("waiting"), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn claim(&self, worker: WorkerId, lease_for: Duration) -> QueueResult<Option<JobRecord>> {
        self.reap_expired().await?;

        let now = self.clock.now();
        let expires_at = deadline_after(now, lease_for)?;

        let mut conn = self.connection.clone();
        let claimed: Option<String> = self
            .claim_script
            .key(self.key("waiting"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .key(self.key("leases"))
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(worker.to_string())
            .invoke_async(&mut conn)
            .await?;

        let Some(raw) = claimed else {
            return Ok(None);
        };
        let id: JobId = raw
            .parse()
            .map_err(|e| QueueError::BrokerUnavailable(format!("corrupt queue entry: {e}")))?;
        let mut record = self.load(id).await?.ok_or(QueueError::JobNotFound(id))?;
        record.start_attempt(
            Lease {
                owner: worker,
                expires_at,
            },
            now,
        )?;

        // The reaper may have handed the id back if we stalled past the lease.
        let written: i32 = self
            .activate_script
            .key(self.job_key(id))
            .key(self.key("leases"))
            .arg(id.to_string())
            .arg(worker.to_string())
            .arg(serde_json::to_string(&record)?)
            .invoke_async(&mut conn)
            .await?;
        if written != 1 {
            return Err(QueueError::LeaseLost(id));
        }
        Ok(Some(record))
    }

    async fn ack(&self, id: JobId, worker: WorkerId) -> QueueResult<()> {
        let mut record = self.load_leased(id, worker).await?;
        record.mark_succeeded(self.clock.now())?;
        self.settle_leased(&record, worker, Target::Succeeded).await
    }

    async fn requeue(
        &self,
        id: JobId,
        worker: WorkerId,
        delay: Duration,
        failure: JobFailure,
    ) -> QueueResult<()> {
        let now = self.clock.now();
        let retry_at = deadline_after(now, delay)?;
        let mut record = self.load_leased(id, worker).await?;
        record.schedule_retry(retry_at, failure)?;

        let target = if retry_at <= now {
            Target::Waiting
        } else {
            Target::Delayed(retry_at)
        };
        self.settle_leased(&record, worker, target).await
    }

    async fn fail(&self, id: JobId, worker: WorkerId, failure: JobFailure) -> QueueResult<()> {
        let mut record = self.load_leased(id, worker).await?;
        record.mark_failed(failure)?;
        self.settle_leased(&record, worker, Target::Failed).await
    }

    async fn reap_expired(&self) -> QueueResult<usize> {
        let now = self.clock.now();
        let mut conn = self.connection.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(self.key("active"), "-inf", now.timestamp_millis())
            .await?;

        let mut reclaimed = 0;
        for raw in expired {
            let Ok(id) = raw.parse::<JobId>() else {
                tracing::warn!(entry = %raw, "skipping corrupt active entry");
                continue;
            };
            let Some(mut record) = self.load(id).await? else {
                tracing::warn!(job_id = %id, "dropping active entry without a record");
                let _: () = redis::pipe()
                    .atomic()
                    .zrem(self.key("active"), &raw)
                    .ignore()
                    .hdel(self.key("leases"), &raw)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                continue;
            };

            let (owner, status) = match record.status {
                JobStatus::Active => {
                    let Some(lease) = record.lease else {
                        continue;
                    };
                    if !record.lease_expired(now) {
                        continue;
                    }
                    (lease.owner, record.reclaim(now)?)
                }
                // The claimer died before writing the active record: no
                // attempt ran, so the job goes back unchanged.
                JobStatus::Waiting => {
                    let owner: Option<String> = conn.hget(self.key("leases"), &raw).await?;
                    let Some(owner) = owner.and_then(|o| o.parse::<WorkerId>().ok()) else {
                        continue;
                    };
                    (owner, JobStatus::Waiting)
                }
                JobStatus::Succeeded | JobStatus::Failed => continue,
            };

            let target = if status == JobStatus::Failed {
                Target::Failed
            } else {
                Target::Waiting
            };
            if self.settle(&record, owner, target, Some(now)).await? {
                tracing::warn!(job_id = %id, kind = %record.kind, attempts = record.attempts, ?status, "lease expired, job reclaimed");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        self.load(id).await
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.connection.clone();
        let (waiting, delayed, active, succeeded, failed): (usize, usize, usize, Option<usize>, usize) =
            redis::pipe()
                .llen(self.key("waiting"))
                .zcard(self.key("delayed"))
                .zcard(self.key("active"))
                .get(self.key("succeeded"))
                .llen(self.key("failed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting: waiting + delayed,
            active,
            succeeded: succeeded.unwrap_or(0),
            failed,
        })
    }
}
