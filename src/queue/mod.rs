// ============================================================================
// Channel work queues: priority, delayed-delivery job store over Redis
// ============================================================================
//
// One queue per channel (email, push, sms). Layout per queue, under a common
// key prefix:
//
//   {q}:ready    ZSET  job id -> (inverted priority, enqueue seq)
//   {q}:delayed  ZSET  job id -> delay_until (epoch ms)
//   {q}:active   ZSET  job id -> stall deadline (epoch ms)
//   {q}:jobs     HASH  job id -> job JSON
//   {q}:scores   HASH  job id -> ready score (recomputed only at enqueue)
//   {q}:stalls   HASH  job id -> reassignment count
//   {q}:seq      STRING  monotonically increasing enqueue counter
//   {q}:completed / {q}:failed   LIST  bounded history records
//
// Multi-key state changes run as Lua scripts so that concurrent consumers
// never observe a job in two sets at once.
//
// ============================================================================

pub mod job;

pub use job::{FailedRecord, Job};

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use crate::config::{RedisConfig, WorkerConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::model::Channel;

/// Completed-job records retained for observability.
const COMPLETED_KEEP: isize = 5;

/// Failed/dead-job records retained for observability.
const FAILED_KEEP: isize = 3;

/// Seq values occupy the low bits of the ready score; priorities the high
/// bits. 2^40 leaves headroom under the f64 integer limit.
const SEQ_SPAN: i64 = 1 << 40;

/// Snapshot of one queue's depth figures.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
}

/// Outcome of reporting a job failure to its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled with backoff; the job will become ready at the instant.
    Rescheduled { attempts: u32, retry_at_ms: i64 },
    /// Attempts exhausted (or failure permanent): job is dead.
    Dead { attempts: u32 },
}

/// One channel's priority/delay job queue.
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
    channel: Channel,
    prefix: String,
    max_attempts: u32,
    max_stalled: u32,
    stalled_interval_ms: i64,
    backoff_base_ms: u64,
}

impl JobQueue {
    pub fn new(
        conn: ConnectionManager,
        channel: Channel,
        redis: &RedisConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            conn,
            channel,
            prefix: format!("{}{}", redis.key_prefix, channel.queue_name()),
            max_attempts: worker.max_attempts,
            max_stalled: worker.max_stalled_count,
            stalled_interval_ms: (worker.stalled_interval_secs * 1_000) as i64,
            backoff_base_ms: worker.retry_backoff_base_ms,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    fn key(&self, part: &str) -> String {
        format!("{}:{}", self.prefix, part)
    }

    /// Enqueue a job. Jobs whose `delay_until` lies in the future land on
    /// the delayed set and are promoted on dequeue once due.
    pub async fn enqueue(&self, job: &Job) -> DispatchResult<()> {
        let payload = serde_json::to_string(job)
            .map_err(|e| DispatchError::internal(format!("job encode: {}", e)))?;
        let now_ms = Utc::now().timestamp_millis();
        let delay_ms = job.delay_until.timestamp_millis();

        let script = Script::new(
            r#"
            local seq = redis.call('INCR', KEYS[1])
            local score = (100 - tonumber(ARGV[1])) * tonumber(ARGV[6]) + seq
            redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
            redis.call('HSET', KEYS[3], ARGV[2], score)
            if tonumber(ARGV[4]) > tonumber(ARGV[5]) then
                redis.call('ZADD', KEYS[4], ARGV[4], ARGV[2])
            else
                redis.call('ZADD', KEYS[5], score, ARGV[2])
            end
            return seq
            "#,
        );

        let mut conn = self.conn.clone();
        let seq: i64 = script
            .key(self.key("seq"))
            .key(self.key("jobs"))
            .key(self.key("scores"))
            .key(self.key("delayed"))
            .key(self.key("ready"))
            .arg(job.priority)
            .arg(&job.notification_id)
            .arg(&payload)
            .arg(delay_ms)
            .arg(now_ms)
            .arg(SEQ_SPAN)
            .invoke_async(&mut conn)
            .await?;

        debug!(
            channel = %self.channel,
            notification_id = %job.notification_id,
            priority = job.priority,
            seq = seq,
            delayed = delay_ms > now_ms,
            "enqueued job"
        );
        Ok(())
    }

    /// Take the highest-priority ready job, promoting due delayed jobs
    /// first. The taken job becomes active until acked, failed or reclaimed
    /// after the stall deadline.
    pub async fn dequeue(&self) -> DispatchResult<Option<Job>> {
        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = now_ms + self.stalled_interval_ms;

        let script = Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            for i, id in ipairs(due) do
                local score = redis.call('HGET', KEYS[2], id)
                if score then
                    redis.call('ZADD', KEYS[3], score, id)
                end
                redis.call('ZREM', KEYS[1], id)
            end
            local popped = redis.call('ZPOPMIN', KEYS[3], 1)
            if #popped == 0 then
                return false
            end
            local id = popped[1]
            redis.call('ZADD', KEYS[4], ARGV[2], id)
            return redis.call('HGET', KEYS[5], id)
            "#,
        );

        let mut conn = self.conn.clone();
        let payload: Option<String> = script
            .key(self.key("delayed"))
            .key(self.key("scores"))
            .key(self.key("ready"))
            .key(self.key("active"))
            .key(self.key("jobs"))
            .arg(now_ms)
            .arg(deadline_ms)
            .invoke_async(&mut conn)
            .await?;

        match payload {
            Some(json) => {
                let job: Job = serde_json::from_str(&json)
                    .map_err(|e| DispatchError::internal(format!("job decode: {}", e)))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Report successful completion: the job leaves the active set and a
    /// bounded history record is kept.
    pub async fn complete(&self, job: &Job) -> DispatchResult<()> {
        let record = serde_json::to_string(job)
            .map_err(|e| DispatchError::internal(format!("job encode: {}", e)))?;

        let script = Script::new(
            r#"
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('HDEL', KEYS[2], ARGV[1])
            redis.call('HDEL', KEYS[3], ARGV[1])
            redis.call('HDEL', KEYS[4], ARGV[1])
            redis.call('LPUSH', KEYS[5], ARGV[2])
            redis.call('LTRIM', KEYS[5], 0, ARGV[3])
            return 1
            "#,
        );

        let mut conn = self.conn.clone();
        let _: i64 = script
            .key(self.key("active"))
            .key(self.key("jobs"))
            .key(self.key("scores"))
            .key(self.key("stalls"))
            .key(self.key("completed"))
            .arg(&job.notification_id)
            .arg(&record)
            .arg(COMPLETED_KEEP - 1)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Report a failed attempt. Retryable failures reschedule with
    /// exponential backoff until `max_attempts`; permanent failures and
    /// exhausted jobs are declared dead.
    pub async fn fail(&self, job: &Job, error: &str, retryable: bool) -> DispatchResult<FailOutcome> {
        let attempts = job.attempts + 1;

        if !retryable || attempts >= self.max_attempts {
            self.bury(job, attempts, error).await?;
            return Ok(FailOutcome::Dead { attempts });
        }

        // Exponential backoff: base, 2x, 4x, ...
        let backoff_ms = self.backoff_base_ms.saturating_mul(1 << (attempts - 1)) as i64;
        let retry_at_ms = Utc::now().timestamp_millis() + backoff_ms;

        let mut retried = job.clone();
        retried.attempts = attempts;
        let payload = serde_json::to_string(&retried)
            .map_err(|e| DispatchError::internal(format!("job encode: {}", e)))?;

        let script = Script::new(
            r#"
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
            redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
            return 1
            "#,
        );

        let mut conn = self.conn.clone();
        let _: i64 = script
            .key(self.key("active"))
            .key(self.key("jobs"))
            .key(self.key("delayed"))
            .arg(&job.notification_id)
            .arg(&payload)
            .arg(retry_at_ms)
            .invoke_async(&mut conn)
            .await?;

        info!(
            channel = %self.channel,
            notification_id = %job.notification_id,
            attempts = attempts,
            backoff_ms = backoff_ms,
            error = %error,
            "job rescheduled"
        );
        Ok(FailOutcome::Rescheduled { attempts, retry_at_ms })
    }

    async fn bury(&self, job: &Job, attempts: u32, error: &str) -> DispatchResult<()> {
        let mut dead = job.clone();
        dead.attempts = attempts;
        let record = serde_json::to_string(&FailedRecord {
            job: dead,
            error: error.to_string(),
            failed_at: Utc::now(),
        })
        .map_err(|e| DispatchError::internal(format!("record encode: {}", e)))?;

        let script = Script::new(
            r#"
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('HDEL', KEYS[2], ARGV[1])
            redis.call('HDEL', KEYS[3], ARGV[1])
            redis.call('HDEL', KEYS[4], ARGV[1])
            redis.call('LPUSH', KEYS[5], ARGV[2])
            redis.call('LTRIM', KEYS[5], 0, ARGV[3])
            return 1
            "#,
        );

        let mut conn = self.conn.clone();
        let _: i64 = script
            .key(self.key("active"))
            .key(self.key("jobs"))
            .key(self.key("scores"))
            .key(self.key("stalls"))
            .key(self.key("failed"))
            .arg(&job.notification_id)
            .arg(&record)
            .arg(FAILED_KEEP - 1)
            .invoke_async(&mut conn)
            .await?;

        warn!(
            channel = %self.channel,
            notification_id = %job.notification_id,
            attempts = attempts,
            error = %error,
            "job dead after exhausting retries"
        );
        Ok(())
    }

    /// Reclaim active jobs whose consumer missed the stall deadline.
    ///
    /// A stalled job is reassigned (back to ready) at most `max_stalled`
    /// times; beyond that it is buried and its id returned so the caller can
    /// finalise the owning notification.
    pub async fn reclaim_stalled(&self) -> DispatchResult<Vec<String>> {
        let now_ms = Utc::now().timestamp_millis();

        let script = Script::new(
            r#"
            local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            local dead = {}
            for i, id in ipairs(expired) do
                redis.call('ZREM', KEYS[1], id)
                local stalls = redis.call('HINCRBY', KEYS[2], id, 1)
                if stalls > tonumber(ARGV[2]) then
                    local payload = redis.call('HGET', KEYS[3], id)
                    redis.call('HDEL', KEYS[3], id)
                    redis.call('HDEL', KEYS[4], id)
                    redis.call('HDEL', KEYS[2], id)
                    table.insert(dead, id)
                    if payload then
                        table.insert(dead, payload)
                    else
                        table.insert(dead, '')
                    end
                else
                    local score = redis.call('HGET', KEYS[4], id)
                    if score then
                        redis.call('ZADD', KEYS[5], score, id)
                    end
                end
            end
            return dead
            "#,
        );

        let mut conn = self.conn.clone();
        let flat: Vec<String> = script
            .key(self.key("active"))
            .key(self.key("stalls"))
            .key(self.key("jobs"))
            .key(self.key("scores"))
            .key(self.key("ready"))
            .arg(now_ms)
            .arg(self.max_stalled)
            .invoke_async(&mut conn)
            .await?;

        let mut dead_ids = Vec::new();
        for pair in flat.chunks(2) {
            let id = pair[0].clone();
            let payload = pair.get(1).cloned().unwrap_or_default();
            if !payload.is_empty() {
                if let Ok(job) = serde_json::from_str::<Job>(&payload) {
                    let record = FailedRecord {
                        job,
                        error: "stalled: consumer did not report in time".to_string(),
                        failed_at: Utc::now(),
                    };
                    if let Ok(encoded) = serde_json::to_string(&record) {
                        let mut conn = self.conn.clone();
                        let _: Result<(), redis::RedisError> = async {
                            let _: () = conn.lpush(self.key("failed"), encoded).await?;
                            let _: () =
                                conn.ltrim(self.key("failed"), 0, FAILED_KEEP - 1).await?;
                            Ok(())
                        }
                        .await;
                    }
                }
            }
            warn!(
                channel = %self.channel,
                notification_id = %id,
                "stalled job exceeded reassignment budget"
            );
            dead_ids.push(id);
        }
        Ok(dead_ids)
    }

    /// Depth figures: waiting = ready + delayed, active = taken.
    pub async fn counts(&self) -> DispatchResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let (waiting_ready, waiting_delayed, active): (u64, u64, u64) = redis::pipe()
            .zcard(self.key("ready"))
            .zcard(self.key("delayed"))
            .zcard(self.key("active"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            waiting: waiting_ready + waiting_delayed,
            active,
        })
    }

    pub async fn ping(&self) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// The three per-channel queues behind one Redis connection.
#[derive(Clone)]
pub struct ChannelQueues {
    email: JobQueue,
    push: JobQueue,
    sms: JobQueue,
}

impl ChannelQueues {
    pub fn new(conn: ConnectionManager, redis: &RedisConfig, worker: &WorkerConfig) -> Self {
        Self {
            email: JobQueue::new(conn.clone(), Channel::Email, redis, worker),
            push: JobQueue::new(conn.clone(), Channel::Push, redis, worker),
            sms: JobQueue::new(conn, Channel::Sms, redis, worker),
        }
    }

    pub fn for_channel(&self, channel: Channel) -> &JobQueue {
        match channel {
            Channel::Email => &self.email,
            Channel::Push => &self.push,
            Channel::Sms => &self.sms,
        }
    }

    pub fn all(&self) -> [&JobQueue; 3] {
        [&self.email, &self.push, &self.sms]
    }

    /// Aggregate depth across every channel.
    pub async fn total_counts(&self) -> DispatchResult<QueueCounts> {
        let mut total = QueueCounts::default();
        for queue in self.all() {
            let counts = queue.counts().await?;
            total.waiting += counts.waiting;
            total.active += counts.active;
        }
        Ok(total)
    }
}
