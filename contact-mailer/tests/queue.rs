use contact_mailer::{
    queue::{Job, JobQueue, QueueConfig, RedisJobQueue},
    validation::ContactSubmission,
};
use googletest::prelude::*;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use serial_test::serial;
use std::time::Duration;
use test_support::{redis_container::RedisConfig, setup_logging};

const WAIT: &str = "contact:mailQueue:wait";
const ACTIVE: &str = "contact:mailQueue:active";
const DELAYED: &str = "contact:mailQueue:delayed";
const FAILED: &str = "contact:mailQueue:failed";
const SHORT_WAIT: Duration = Duration::from_millis(100);

fn queue(redis: &RedisConfig, max_attempts: u32, backoff: Duration) -> RedisJobQueue {
    RedisJobQueue::new(&QueueConfig {
        host: redis.host.clone(),
        port: redis.port,
        max_attempts,
        backoff,
    })
    .unwrap()
}

/// A separate connection for looking at the queue's keys, starting from an empty database.
async fn inspector(redis: &RedisConfig) -> MultiplexedConnection {
    let client = redis::Client::open(redis.url()).unwrap();
    let mut con = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("FLUSHDB").query_async(&mut con).await.unwrap();
    con
}

fn submission(email: &str) -> ContactSubmission {
    ContactSubmission {
        name: "Ana".into(),
        email: email.into(),
        message: "hello".into(),
    }
}

async fn len(con: &mut MultiplexedConnection, key: &str) -> usize {
    con.llen(key).await.unwrap()
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn reserves_and_completes_job() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 3, Duration::from_secs(5));

    let id = queue.enqueue(&submission("a@b.com")).await.unwrap();
    let job = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();

    expect_that!(id, eq("1"));
    expect_that!(job.id, eq("1"));
    expect_that!(job.attempts, eq(0));
    expect_that!(job.data, eq(submission("a@b.com")));
    expect_that!(len(&mut con, ACTIVE).await, eq(1));

    queue.complete(&job).await.unwrap();

    expect_that!(len(&mut con, ACTIVE).await, eq(0));
    expect_that!(queue.reserve(SHORT_WAIT).await.unwrap(), none());
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn completing_job_twice_removes_only_that_job() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 3, Duration::from_secs(5));
    queue.enqueue(&submission("a@b.com")).await.unwrap();
    queue.enqueue(&submission("c@d.com")).await.unwrap();
    let first = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();
    let second = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();

    queue.complete(&first).await.unwrap();
    queue.complete(&first).await.unwrap();

    let active: Vec<String> = con.lrange(ACTIVE, 0, -1).await.unwrap();
    expect_that!(active, elements_are![eq(second.raw.as_str())]);
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn delays_failed_job_until_backoff_expires() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 3, Duration::from_secs(60));
    queue.enqueue(&submission("a@b.com")).await.unwrap();
    let job = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();

    queue.fail(&job, "421 try later").await.unwrap();

    let delayed: usize = con.zcard(DELAYED).await.unwrap();
    expect_that!(delayed, eq(1));
    expect_that!(len(&mut con, ACTIVE).await, eq(0));
    expect_that!(queue.reserve(SHORT_WAIT).await.unwrap(), none());
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn retries_failed_job_once_due() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 3, Duration::ZERO);
    queue.enqueue(&submission("a@b.com")).await.unwrap();
    let job = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();

    queue.fail(&job, "421 try later").await.unwrap();
    let retried = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();

    expect_that!(retried.id, eq("1"));
    expect_that!(retried.attempts, eq(1));
    expect_that!(retried.last_error, some(eq("421 try later")));
    let delayed: usize = con.zcard(DELAYED).await.unwrap();
    expect_that!(delayed, eq(0));
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn parks_job_after_last_attempt() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 1, Duration::ZERO);
    queue.enqueue(&submission("a@b.com")).await.unwrap();
    let job = queue.reserve(SHORT_WAIT).await.unwrap().unwrap();

    queue.fail(&job, "550 rejected").await.unwrap();

    let failed: Vec<String> = con.lrange(FAILED, 0, -1).await.unwrap();
    expect_that!(
        failed,
        elements_are![all!(
            contains_substring("\"attempts\":1"),
            contains_substring("550 rejected")
        )]
    );
    let delayed: usize = con.zcard(DELAYED).await.unwrap();
    expect_that!(delayed, eq(0));
    expect_that!(len(&mut con, ACTIVE).await, eq(0));
    expect_that!(queue.reserve(SHORT_WAIT).await.unwrap(), none());
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn hands_due_job_to_a_single_worker() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let first_worker = queue(&redis, 3, Duration::ZERO);
    let second_worker = queue(&redis, 3, Duration::ZERO);
    first_worker.enqueue(&submission("a@b.com")).await.unwrap();
    let job = first_worker.reserve(SHORT_WAIT).await.unwrap().unwrap();
    first_worker.fail(&job, "421 try later").await.unwrap();

    let (first, second) = tokio::join!(
        first_worker.reserve(SHORT_WAIT),
        second_worker.reserve(SHORT_WAIT)
    );

    let reserved: Vec<_> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    expect_that!(reserved.len(), eq(1));
    expect_that!(len(&mut con, ACTIVE).await, eq(1));
    expect_that!(len(&mut con, WAIT).await, eq(0));
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn recovers_job_left_active_by_previous_worker() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let crashed = queue(&redis, 3, Duration::from_secs(5));
    crashed.enqueue(&submission("a@b.com")).await.unwrap();
    crashed.reserve(SHORT_WAIT).await.unwrap().unwrap();
    drop(crashed);
    let restarted = queue(&redis, 3, Duration::from_secs(5));

    let recovered = restarted.recover().await.unwrap();
    let job = restarted.reserve(SHORT_WAIT).await.unwrap();

    expect_that!(recovered, eq(1));
    expect_that!(job, some(field!(Job.id, eq("1"))));
    expect_that!(len(&mut con, ACTIVE).await, eq(1));
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn moves_unreadable_job_to_failed_list() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 3, Duration::from_secs(5));
    let _: () = con.lpush(WAIT, "not json").await.unwrap();

    let reserved = queue.reserve(SHORT_WAIT).await;

    expect_that!(reserved, ok(none()));
    let failed: Vec<String> = con.lrange(FAILED, 0, -1).await.unwrap();
    expect_that!(failed, elements_are![eq("not json")]);
    expect_that!(len(&mut con, ACTIVE).await, eq(0));
}

#[googletest::test]
#[tokio::test]
#[serial]
async fn reconnects_after_connection_is_dropped() {
    setup_logging();
    let redis = RedisConfig::new().await;
    let mut con = inspector(&redis).await;
    let queue = queue(&redis, 3, Duration::from_secs(5));
    queue.ping().await.unwrap();

    // Closes every client connection except this one.
    let _: () = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("normal")
        .query_async(&mut con)
        .await
        .unwrap();
    let mut enqueued = queue.enqueue(&submission("a@b.com")).await;
    for _ in 0..20 {
        if enqueued.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        enqueued = queue.enqueue(&submission("a@b.com")).await;
    }

    expect_that!(enqueued, ok(anything()));
    expect_that!(queue.ping().await, ok(anything()));
    expect_that!(len(&mut con, WAIT).await, eq(1));
}
