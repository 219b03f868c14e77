//! A small durable job queue on Redis.
//!
//! Jobs move between four keys: `wait` (ready to run), `active` (reserved by a worker),
//! `delayed` (a sorted set scored by the time the next attempt is due) and `failed` (out of
//! attempts). A job reserved by a worker which dies before acknowledging it stays in `active`
//! until [`JobQueue::recover`] puts it back, so every job is delivered at least once.

use crate::{error::MailError, validation::ContactSubmission};
use async_once_cell::OnceCell;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

const QUEUE_NAME: &str = "mailQueue";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub max_attempts: u32,
    pub backoff: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub attempts: u32,
    pub data: ContactSubmission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The stored representation, needed to remove the job from its list.
    #[serde(skip)]
    pub raw: String,
}

impl Job {
    fn parse(raw: &str) -> Result<Self, MailError> {
        let job: Job = serde_json::from_str(raw)?;
        Ok(Job {
            raw: raw.into(),
            ..job
        })
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, submission: &ContactSubmission) -> Result<String, MailError>;

    /// Waits up to `timeout` for the next job and marks it as active.
    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>, MailError>;

    /// Acknowledges a successfully processed job.
    async fn complete(&self, job: &Job) -> Result<(), MailError>;

    /// Records a failed attempt. The job is retried later or, when out of attempts, parked.
    async fn fail(&self, job: &Job, reason: &str) -> Result<(), MailError>;

    /// Returns jobs left active by a previous worker to the wait list.
    async fn recover(&self) -> Result<usize, MailError>;

    async fn ping(&self) -> Result<(), MailError>;
}

/// Delay before attempt `attempts + 1`, doubling with every failed attempt.
pub fn retry_delay(backoff: Duration, attempts: u32) -> Duration {
    backoff.saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
}

struct QueueKeys {
    id: String,
    wait: String,
    active: String,
    delayed: String,
    failed: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        let prefix = format!("contact:{name}");
        Self {
            id: format!("{prefix}:id"),
            wait: format!("{prefix}:wait"),
            active: format!("{prefix}:active"),
            delayed: format!("{prefix}:delayed"),
            failed: format!("{prefix}:failed"),
        }
    }
}

pub struct RedisJobQueue {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    keys: QueueKeys,
    max_attempts: u32,
    backoff: Duration,
}

impl RedisJobQueue {
    pub fn new(config: &QueueConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(format!("redis://{}:{}/", config.host, config.port))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            keys: QueueKeys::new(QUEUE_NAME),
            max_attempts: config.max_attempts,
            backoff: config.backoff,
        })
    }

    /// The shared connection, established on first use. It reconnects by itself after the
    /// server goes away; commands issued while it is down fail.
    async fn connection(&self) -> Result<ConnectionManager, MailError> {
        let connection = self
            .connection
            .get_or_try_init(self.client.get_connection_manager())
            .await?;
        Ok(connection.clone())
    }

    async fn promote_delayed(&self, con: &mut ConnectionManager) -> Result<(), MailError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.keys.delayed)
            .arg("-inf")
            .arg(now_millis())
            .query_async(con)
            .await?;
        for raw in due {
            // Only the worker whose ZREM succeeds moves the job.
            let removed: i64 = con.zrem(&self.keys.delayed, &raw).await?;
            if removed == 1 {
                let _: () = con.lpush(&self.keys.wait, &raw).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, submission: &ContactSubmission) -> Result<String, MailError> {
        let mut con = self.connection().await?;
        let id: u64 = con.incr(&self.keys.id, 1).await?;
        let job = Job {
            id: id.to_string(),
            attempts: 0,
            data: submission.clone(),
            last_error: None,
            raw: String::new(),
        };
        let _: () = con
            .lpush(&self.keys.wait, serde_json::to_string(&job)?)
            .await?;
        Ok(job.id)
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>, MailError> {
        let mut con = self.connection().await?;
        self.promote_delayed(&mut con).await?;
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.keys.wait)
            .arg(&self.keys.active)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut con)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match Job::parse(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(parse_error) => {
                error!("Moving unreadable job to {}: {parse_error}", self.keys.failed);
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("LREM")
                    .arg(&self.keys.active)
                    .arg(1)
                    .arg(&raw)
                    .ignore()
                    .cmd("LPUSH")
                    .arg(&self.keys.failed)
                    .arg(&raw)
                    .ignore()
                    .query_async(&mut con)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, job: &Job) -> Result<(), MailError> {
        let mut con = self.connection().await?;
        let _: () = con.lrem(&self.keys.active, 1, &job.raw).await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str) -> Result<(), MailError> {
        let mut con = self.connection().await?;
        let attempts = job.attempts + 1;
        let retried = Job {
            attempts,
            last_error: Some(reason.into()),
            ..job.clone()
        };
        let raw = serde_json::to_string(&retried)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.keys.active)
            .arg(1)
            .arg(&job.raw)
            .ignore();
        if attempts < self.max_attempts {
            let delay = retry_delay(self.backoff, attempts);
            warn!("Job {} failed (attempt {attempts}), retrying in {delay:?}", job.id);
            pipe.cmd("ZADD")
                .arg(&self.keys.delayed)
                .arg(now_millis() + delay.as_millis() as u64)
                .arg(&raw)
                .ignore();
        } else {
            warn!("Job {} failed after {attempts} attempts, giving up", job.id);
            pipe.cmd("LPUSH").arg(&self.keys.failed).arg(&raw).ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn recover(&self) -> Result<usize, MailError> {
        let mut con = self.connection().await?;
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.active)
                .arg(&self.keys.wait)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut con)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!("Returned {recovered} stranded jobs to the queue");
        }
        Ok(recovered)
    }

    async fn ping(&self) -> Result<(), MailError> {
        let mut con = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
