// ============================================================================
// Channel workers: per-channel pools consuming the work queues
// ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::metrics::MetricsCollector;
use crate::model::{Channel, Metadata, NotificationStatus};
use crate::queue::{FailOutcome, Job, JobQueue};
use crate::resolver::ChannelResolver;
use crate::store::NotificationStore;
use crate::template::{render, RenderedContent};

use crate::adapters::ChannelAdapter;

/// One channel's worker pool plus its stalled-job reclaimer.
pub struct ChannelWorkerPool {
    queue: JobQueue,
    adapter: Arc<dyn ChannelAdapter>,
    store: NotificationStore,
    resolver: Arc<ChannelResolver>,
    metrics: Arc<MetricsCollector>,
    config: WorkerConfig,
}

impl ChannelWorkerPool {
    pub fn new(
        queue: JobQueue,
        adapter: Arc<dyn ChannelAdapter>,
        store: NotificationStore,
        resolver: Arc<ChannelResolver>,
        metrics: Arc<MetricsCollector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            adapter,
            store,
            resolver,
            metrics,
            config,
        }
    }

    /// Spawn the consumers and the reclaimer; returns their handles.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers_per_channel + 1);

        for worker_index in 0..self.config.workers_per_channel {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.consume_loop(worker_index, shutdown).await;
            }));
        }

        let pool = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            pool.reclaim_loop(shutdown).await;
        }));

        handles
    }

    async fn consume_loop(&self, worker_index: usize, mut shutdown: watch::Receiver<bool>) {
        let channel = self.queue.channel();
        info!(channel = %channel, worker = worker_index, "channel worker started");
        self.metrics.worker_started();

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    consecutive_errors = 0;
                    self.process(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(2u64.pow(consecutive_errors.min(5)).min(30));
                    warn!(
                        channel = %channel,
                        worker = worker_index,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "dequeue failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        self.metrics.worker_stopped();
        info!(channel = %channel, worker = worker_index, "channel worker stopped");
    }

    /// Per-job procedure: QUEUED -> PROCESSING, resolve, render, deliver,
    /// then SENT, or FAILED plus the queue's retry decision.
    async fn process(&self, job: Job) {
        let channel = self.queue.channel();
        debug!(
            channel = %channel,
            notification_id = %job.notification_id,
            attempt = job.attempts + 1,
            "processing job"
        );

        if let Err(e) = self
            .store
            .update_status(&job.notification_id, NotificationStatus::Processing, None)
            .await
        {
            // Without the PROCESSING mark the job must not proceed; let the
            // stall reclaim hand it to another consumer.
            error!(notification_id = %job.notification_id, error = %e, "status update failed");
            return;
        }

        match self.attempt_delivery(&job).await {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .update_status(&job.notification_id, NotificationStatus::Sent, None)
                    .await
                {
                    error!(notification_id = %job.notification_id, error = %e, "sent-status update failed");
                }
                if let Err(e) = self.queue.complete(&job).await {
                    warn!(notification_id = %job.notification_id, error = %e, "queue ack failed");
                }
                self.metrics.record_processed();
                info!(
                    channel = %channel,
                    notification_id = %job.notification_id,
                    "notification sent"
                );
            }
            Err(err) => {
                self.metrics.record_error();
                let message = err.to_string();

                if let Err(e) = self
                    .store
                    .update_status(
                        &job.notification_id,
                        NotificationStatus::Failed,
                        Some(&message),
                    )
                    .await
                {
                    error!(notification_id = %job.notification_id, error = %e, "failed-status update failed");
                }
                if let Err(e) = self.store.increment_retry(&job.notification_id).await {
                    error!(notification_id = %job.notification_id, error = %e, "retry bump failed");
                }

                match self.queue.fail(&job, &message, err.is_retryable()).await {
                    Ok(FailOutcome::Rescheduled { attempts, .. }) => {
                        // Back to QUEUED while the delayed retry waits.
                        if let Err(e) = self
                            .store
                            .update_status(&job.notification_id, NotificationStatus::Queued, None)
                            .await
                        {
                            error!(notification_id = %job.notification_id, error = %e, "requeue-status update failed");
                        }
                        debug!(
                            channel = %channel,
                            notification_id = %job.notification_id,
                            attempts = attempts,
                            "delivery failed, retry scheduled"
                        );
                    }
                    Ok(FailOutcome::Dead { attempts }) => {
                        warn!(
                            channel = %channel,
                            notification_id = %job.notification_id,
                            attempts = attempts,
                            error_code = err.error_code(),
                            "delivery failed terminally"
                        );
                    }
                    Err(e) => {
                        error!(notification_id = %job.notification_id, error = %e, "queue failure report failed");
                    }
                }
            }
        }
    }

    async fn attempt_delivery(&self, job: &Job) -> DispatchResult<()> {
        let channel = self.queue.channel();

        let recipient = self
            .resolver
            .recipient(&job.user_id, channel)
            .await
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                DispatchError::recipient_missing(
                    channel.as_str(),
                    match channel {
                        Channel::Email => "no email address on record",
                        Channel::Sms => "no phone number on record",
                        Channel::Push => "no active device tokens",
                    },
                )
            })?;

        let content = self.render_content(job, channel).await;

        let timeout = Duration::from_secs(self.config.adapter_timeout_secs);
        match tokio::time::timeout(timeout, self.adapter.deliver(job, &recipient, &content)).await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::AdapterTransient(format!(
                "{} adapter timed out after {}s",
                channel,
                timeout.as_secs()
            ))),
        }
    }

    /// Active template rendered with `{title, message, ...metadata}`; raw
    /// job fields when no template exists.
    async fn render_content(&self, job: &Job, channel: Channel) -> RenderedContent {
        match self.resolver.template(&job.notification_type, channel).await {
            Some(template) => {
                let mut variables = Metadata::new();
                variables.insert(
                    "title".to_string(),
                    serde_json::Value::String(job.title.clone()),
                );
                variables.insert(
                    "message".to_string(),
                    serde_json::Value::String(job.message.clone()),
                );
                if let Some(metadata) = &job.metadata {
                    for (key, value) in metadata {
                        variables.insert(key.clone(), value.clone());
                    }
                }
                render(&template, &variables)
            }
            None => RenderedContent {
                title: job.title.clone(),
                message: job.message.clone(),
                html_content: None,
            },
        }
    }

    /// Reclaims stalled jobs on the queue's cadence and finalises the
    /// notifications of jobs that exhausted their reassignment budget.
    async fn reclaim_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let channel = self.queue.channel();
        let interval = Duration::from_secs(self.config.stalled_interval_secs);

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

            match self.queue.reclaim_stalled().await {
                Ok(dead_ids) => {
                    for id in dead_ids {
                        self.metrics.record_error();
                        if let Err(e) = self
                            .store
                            .update_status(
                                &id,
                                NotificationStatus::Failed,
                                Some("job stalled past its reassignment budget"),
                            )
                            .await
                        {
                            error!(notification_id = %id, error = %e, "stall finalisation failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "stall reclaim failed");
                }
            }
        }
    }
}

/// Exercised by retry passes and admin triggers on a fixed cadence.
pub fn spawn_retry_scan(
    dispatcher: Arc<crate::dispatch::Dispatcher>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs);
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
            if let Err(e) = dispatcher.retry_failed().await {
                warn!(error = %e, "retry pass failed");
            }
        }
    })
}
