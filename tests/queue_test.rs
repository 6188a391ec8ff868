// ============================================================================
// Channel work queue tests
// ============================================================================
//
// These tests exercise the Redis-backed queue end to end and therefore need
// a running Redis (REDIS_URL, default redis://127.0.0.1:6379). They are
// ignored by default; run with `cargo test -- --ignored` on a machine with
// Redis available.
//
// ============================================================================

use chrono::{Duration as ChronoDuration, Utc};
use serial_test::serial;
use std::time::Duration;
use uuid::Uuid;

use courier_server::config::{RedisConfig, WorkerConfig};
use courier_server::model::{Channel, NotificationType};
use courier_server::queue::{FailOutcome, Job, JobQueue};

fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        workers_per_channel: 1,
        adapter_timeout_secs: 5,
        poll_interval_ms: 50,
        stalled_interval_secs: 1,
        max_stalled_count: 1,
        retry_backoff_base_ms: 100,
        max_attempts: 3,
    }
}

fn test_redis_config() -> RedisConfig {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let host = url
        .trim_start_matches("redis://")
        .split(':')
        .next()
        .unwrap_or("127.0.0.1")
        .to_string();
    RedisConfig {
        host,
        port: 6379,
        password: None,
        db: 0,
        pool_size: 5,
        // Unique prefix per test run keeps state isolated.
        key_prefix: format!("courier:test:{}:", Uuid::new_v4()),
    }
}

async fn setup_queue(channel: Channel) -> JobQueue {
    let redis = test_redis_config();
    let client = redis::Client::open(redis.url()).expect("redis url");
    let conn = client
        .get_connection_manager()
        .await
        .expect("redis connection");
    JobQueue::new(conn, channel, &redis, &test_worker_config())
}

fn job(id: &str, priority: i64) -> Job {
    Job {
        notification_id: id.to_string(),
        user_id: "u-test".to_string(),
        notification_type: NotificationType::Welcome,
        channel: Channel::Email,
        title: "t".to_string(),
        message: "m".to_string(),
        metadata: None,
        priority,
        delay_until: Utc::now(),
        attempts: 0,
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn higher_priority_dequeues_first() {
    let queue = setup_queue(Channel::Email).await;

    queue.enqueue(&job("low", 1)).await.unwrap();
    queue.enqueue(&job("urgent", 20)).await.unwrap();
    queue.enqueue(&job("normal", 5)).await.unwrap();

    let first = queue.dequeue().await.unwrap().unwrap();
    let second = queue.dequeue().await.unwrap().unwrap();
    let third = queue.dequeue().await.unwrap().unwrap();

    assert_eq!(first.notification_id, "urgent");
    assert_eq!(second.notification_id, "normal");
    assert_eq!(third.notification_id, "low");
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn same_priority_is_fifo() {
    let queue = setup_queue(Channel::Email).await;

    for i in 0..5 {
        queue.enqueue(&job(&format!("j{}", i), 5)).await.unwrap();
    }

    for i in 0..5 {
        let next = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(next.notification_id, format!("j{}", i));
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn delayed_job_is_not_dequeueable_early() {
    let queue = setup_queue(Channel::Email).await;

    let mut delayed = job("scheduled", 20);
    delayed.delay_until = Utc::now() + ChronoDuration::milliseconds(800);
    queue.enqueue(&delayed).await.unwrap();

    assert!(queue.dequeue().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(900)).await;
    let promoted = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(promoted.notification_id, "scheduled");
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn failure_reschedules_then_buries_after_max_attempts() {
    let queue = setup_queue(Channel::Email).await;
    queue.enqueue(&job("flaky", 5)).await.unwrap();

    // Attempt 1: transient failure, rescheduled with backoff.
    let taken = queue.dequeue().await.unwrap().unwrap();
    let outcome = queue.fail(&taken, "smtp timeout", true).await.unwrap();
    assert!(matches!(outcome, FailOutcome::Rescheduled { attempts: 1, .. }));

    // The retry sits on the delayed set until its backoff elapses.
    assert!(queue.dequeue().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(150)).await;

    let taken = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(taken.attempts, 1);
    let outcome = queue.fail(&taken, "smtp timeout", true).await.unwrap();
    assert!(matches!(outcome, FailOutcome::Rescheduled { attempts: 2, .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let taken = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(taken.attempts, 2);
    let outcome = queue.fail(&taken, "smtp timeout", true).await.unwrap();
    assert_eq!(outcome, FailOutcome::Dead { attempts: 3 });

    // Dead jobs never come back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn permanent_failure_skips_retry() {
    let queue = setup_queue(Channel::Push).await;
    queue.enqueue(&job("bad-token", 5)).await.unwrap();

    let taken = queue.dequeue().await.unwrap().unwrap();
    let outcome = queue.fail(&taken, "invalid device token", false).await.unwrap();
    assert_eq!(outcome, FailOutcome::Dead { attempts: 1 });
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn stalled_job_is_reassigned_once_then_buried() {
    let queue = setup_queue(Channel::Sms).await;
    queue.enqueue(&job("stuck", 5)).await.unwrap();

    // Take the job and vanish without acking.
    let taken = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(taken.notification_id, "stuck");

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let dead = queue.reclaim_stalled().await.unwrap();
    assert!(dead.is_empty(), "first stall should reassign, not bury");

    // The reassigned job is ready again.
    let taken = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(taken.notification_id, "stuck");

    // Stall a second time: the reassignment budget (1) is exhausted.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let dead = queue.reclaim_stalled().await.unwrap();
    assert_eq!(dead, vec!["stuck".to_string()]);
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis"]
async fn counts_reflect_waiting_and_active() {
    let queue = setup_queue(Channel::Email).await;

    queue.enqueue(&job("a", 5)).await.unwrap();
    let mut later = job("b", 5);
    later.delay_until = Utc::now() + ChronoDuration::seconds(60);
    queue.enqueue(&later).await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.active, 0);

    let _taken = queue.dequeue().await.unwrap().unwrap();
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 1);
}
