use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tonic::codec::CompressionEncoding;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod adapters;
pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod template;
pub mod worker;

use adapters::{ChannelAdapter, PushAdapter, SmsAdapter, SmtpAdapter};
use api::{NotificationApi, NotificationServiceServer};
use config::Config;
use dispatch::Dispatcher;
use events::{EventIngestor, EventProducer};
use metrics::MetricsCollector;
use model::Channel;
use queue::ChannelQueues;
use resolver::ChannelResolver;
use store::NotificationStore;
use worker::ChannelWorkerPool;

/// RPC message cap in either direction.
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // Connect to the relational store and apply migrations
    let pool = db::create_pool(&config.db).await?;
    info!("connected to database");
    sqlx::migrate!().run(&pool).await?;
    info!("database migrations applied");

    // Connect to Redis (queue backing store)
    let redis_client = redis::Client::open(config.redis.url())
        .context("failed to parse Redis URL")?;
    let redis_conn = tokio::time::timeout(
        Duration::from_secs(10),
        redis_client.get_connection_manager(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timed out after 10 seconds"))??;
    info!("connected to Redis");

    let store = NotificationStore::new(pool.clone());
    let resolver = Arc::new(ChannelResolver::new(store.clone()));
    let queues = ChannelQueues::new(redis_conn, &config.redis, &config.worker);
    let metrics = Arc::new(MetricsCollector::new(config.metrics.sample_window)?);
    let producer = EventProducer::new(&config.kafka)?;

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        queues.clone(),
        Arc::clone(&resolver),
    ));

    // Channel adapters
    let email_adapter: Arc<dyn ChannelAdapter> = Arc::new(SmtpAdapter::new(&config.smtp)?);
    let push_adapter: Arc<dyn ChannelAdapter> =
        Arc::new(PushAdapter::new(&config.push, store.clone())?);
    let sms_adapter: Arc<dyn ChannelAdapter> =
        Arc::new(SmsAdapter::new(producer.clone(), config.kafka.sms_topic.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task_handles = Vec::new();

    // Per-channel worker pools
    for (channel, adapter) in [
        (Channel::Email, email_adapter),
        (Channel::Push, push_adapter),
        (Channel::Sms, sms_adapter),
    ] {
        let worker_pool = Arc::new(ChannelWorkerPool::new(
            queues.for_channel(channel).clone(),
            adapter,
            store.clone(),
            Arc::clone(&resolver),
            Arc::clone(&metrics),
            config.worker.clone(),
        ));
        task_handles.extend(worker_pool.spawn(shutdown_rx.clone()));
    }

    // Metrics sampler
    {
        let metrics = Arc::clone(&metrics);
        let queues = queues.clone();
        let interval = config.metrics.sample_interval_secs;
        let shutdown = shutdown_rx.clone();
        task_handles.push(tokio::spawn(async move {
            metrics.run_sampler(queues, interval, shutdown).await;
        }));
    }

    // Retry pass over FAILED rows
    task_handles.push(worker::spawn_retry_scan(
        Arc::clone(&dispatcher),
        config.retry_scan_interval_secs,
        shutdown_rx.clone(),
    ));

    // Retention cleanup
    {
        let store = store.clone();
        let retention_days = config.retention_days;
        let interval = Duration::from_secs(config.cleanup_interval_secs);
        let mut shutdown = shutdown_rx.clone();
        task_handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                match store.delete_terminal_older_than(retention_days).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed = removed, "cleaned up old notifications"),
                    Err(e) => warn!(error = %e, "cleanup pass failed"),
                }
            }
        }));
    }

    // Event ingestor
    {
        let ingestor = EventIngestor::new(
            &config.kafka,
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
        )?;
        let shutdown = shutdown_rx.clone();
        task_handles.push(tokio::spawn(async move {
            ingestor.run(shutdown).await;
        }));
    }

    // gRPC surface
    let addr = format!("0.0.0.0:{}", config.grpc.port).parse()?;
    let api = NotificationApi::new(
        Arc::clone(&dispatcher),
        producer.clone(),
        config.kafka.bulk_topic.clone(),
        Arc::clone(&metrics),
    );
    let service = NotificationServiceServer::new(api)
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip)
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES);

    info!(addr = %addr, "notification service listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(5)))
        .concurrency_limit_per_connection(config.grpc.concurrency_limit)
        .add_service(service)
        .serve_with_shutdown(addr, async move {
            let _ = server_shutdown.changed().await;
        });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "gRPC server failed");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Drain: stop intake, let in-flight handlers finish within the deadline,
    // flush the producer, disconnect.
    let _ = shutdown_tx.send(true);
    let drain = async {
        for handle in task_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(config::SHUTDOWN_DRAIN_SECS), drain)
        .await
        .is_err()
    {
        warn!("drain deadline exceeded, aborting remaining tasks");
    }
    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, "producer flush failed during shutdown");
    }
    info!("shutdown complete");

    Ok(())
}
