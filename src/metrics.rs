// ============================================================================
// Metrics collector: counters, queue depth sampling, rolling window
// ============================================================================

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::model::Channel;
use crate::queue::ChannelQueues;

/// Queue depth above which the service reports unhealthy.
const HEALTHY_MAX_QUEUE_DEPTH: u64 = 1_000;

/// Error rate above which the service reports unhealthy.
const HEALTHY_MAX_ERROR_RATE: f64 = 0.05;

/// One periodic sample of pipeline state.
#[derive(Debug, Clone)]
pub struct MetricsSample {
    pub sampled_at: DateTime<Utc>,
    /// (channel, waiting, active) figures read from the work queues.
    pub per_channel: Vec<(Channel, u64, u64)>,
    pub total_waiting: u64,
    pub total_active_jobs: u64,
    pub total_processed: u64,
    pub total_errors: u64,
    pub throughput_per_second: f64,
    pub error_rate: f64,
}

/// Process-wide pipeline metrics with an explicit lifecycle.
///
/// Counters live in an owned prometheus registry rather than process
/// globals; the sampler task captures a rolling window of the last
/// `window` samples.
pub struct MetricsCollector {
    registry: Registry,
    processed: IntCounter,
    errors: IntCounter,
    malformed_events: IntCounter,
    active_workers: IntGauge,
    queue_waiting: IntGaugeVec,
    queue_active: IntGaugeVec,
    window: Mutex<VecDeque<MetricsSample>>,
    window_size: usize,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new(window_size: usize) -> DispatchResult<Self> {
        let registry = Registry::new();

        let processed = IntCounter::with_opts(Opts::new(
            "courier_notifications_processed_total",
            "Total notifications delivered successfully",
        ))
        .map_err(internal)?;
        let errors = IntCounter::with_opts(Opts::new(
            "courier_notification_errors_total",
            "Total delivery attempts that failed",
        ))
        .map_err(internal)?;
        let malformed_events = IntCounter::with_opts(Opts::new(
            "courier_malformed_events_total",
            "Event-stream messages skipped as malformed",
        ))
        .map_err(internal)?;
        let active_workers = IntGauge::with_opts(Opts::new(
            "courier_active_workers",
            "Channel worker tasks currently running",
        ))
        .map_err(internal)?;
        let queue_waiting = IntGaugeVec::new(
            Opts::new("courier_queue_waiting", "Waiting jobs per channel queue"),
            &["channel"],
        )
        .map_err(internal)?;
        let queue_active = IntGaugeVec::new(
            Opts::new("courier_queue_active", "Active jobs per channel queue"),
            &["channel"],
        )
        .map_err(internal)?;

        registry.register(Box::new(processed.clone())).map_err(internal)?;
        registry.register(Box::new(errors.clone())).map_err(internal)?;
        registry
            .register(Box::new(malformed_events.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(active_workers.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(queue_waiting.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(queue_active.clone()))
            .map_err(internal)?;

        Ok(Self {
            registry,
            processed,
            errors,
            malformed_events,
            active_workers,
            queue_waiting,
            queue_active,
            window: Mutex::new(VecDeque::new()),
            window_size,
            started_at: Instant::now(),
        })
    }

    pub fn record_processed(&self) {
        self.processed.inc();
    }

    pub fn record_error(&self) {
        self.errors.inc();
    }

    pub fn record_malformed_event(&self) {
        self.malformed_events.inc();
    }

    pub fn worker_started(&self) {
        self.active_workers.inc();
    }

    pub fn worker_stopped(&self) {
        self.active_workers.dec();
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.get()
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn active_workers(&self) -> i64 {
        self.active_workers.get()
    }

    /// Take one sample from the queues and append it to the window.
    pub async fn sample(&self, queues: &ChannelQueues) -> DispatchResult<MetricsSample> {
        let mut per_channel = Vec::with_capacity(3);
        let mut total_waiting = 0u64;
        let mut total_active = 0u64;

        for queue in queues.all() {
            let counts = queue.counts().await?;
            self.queue_waiting
                .with_label_values(&[queue.channel().queue_name()])
                .set(counts.waiting as i64);
            self.queue_active
                .with_label_values(&[queue.channel().queue_name()])
                .set(counts.active as i64);
            total_waiting += counts.waiting;
            total_active += counts.active;
            per_channel.push((queue.channel(), counts.waiting, counts.active));
        }

        let total_processed = self.processed.get();
        let total_errors = self.errors.get();
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1.0);

        let sample = MetricsSample {
            sampled_at: Utc::now(),
            per_channel,
            total_waiting,
            total_active_jobs: total_active,
            total_processed,
            total_errors,
            throughput_per_second: total_processed as f64 / elapsed,
            error_rate: total_errors as f64 / (total_processed.max(1)) as f64,
        };

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(sample.clone());
        while window.len() > self.window_size {
            window.pop_front();
        }

        debug!(
            waiting = total_waiting,
            active = total_active,
            processed = total_processed,
            errors = total_errors,
            "metrics sample"
        );
        Ok(sample)
    }

    /// Most recent sample, if any was taken yet.
    pub fn current(&self) -> Option<MetricsSample> {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.back().cloned()
    }

    pub fn average_throughput(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return 0.0;
        }
        window.iter().map(|s| s.throughput_per_second).sum::<f64>() / window.len() as f64
    }

    pub fn peak_throughput(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window
            .iter()
            .map(|s| s.throughput_per_second)
            .fold(0.0, f64::max)
    }

    /// Health predicate: error rate under 5 %, backlog under 1 000 and at
    /// least one live worker.
    pub fn healthy(&self) -> bool {
        let (error_rate, depth) = match self.current() {
            Some(sample) => (sample.error_rate, sample.total_waiting + sample.total_active_jobs),
            None => {
                let processed = self.processed.get();
                let rate = self.errors.get() as f64 / processed.max(1) as f64;
                (rate, 0)
            }
        };
        error_rate < HEALTHY_MAX_ERROR_RATE
            && depth < HEALTHY_MAX_QUEUE_DEPTH
            && self.active_workers.get() > 0
    }

    /// Prometheus text exposition of the owned registry.
    pub fn gather(&self) -> DispatchResult<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(|e| DispatchError::internal(e.to_string()))
    }

    /// Periodic sampling loop; runs until the shutdown signal flips.
    pub async fn run_sampler(
        &self,
        queues: ChannelQueues,
        interval_secs: u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample(&queues).await {
                        warn!(error = %e, "metrics sampling failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn internal<E: std::fmt::Display>(e: E) -> DispatchError {
    DispatchError::internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_requires_live_workers() {
        let metrics = MetricsCollector::new(100).unwrap();
        assert!(!metrics.healthy());

        metrics.worker_started();
        assert!(metrics.healthy());

        metrics.worker_stopped();
        assert!(!metrics.healthy());
    }

    #[test]
    fn error_rate_breaches_health() {
        let metrics = MetricsCollector::new(100).unwrap();
        metrics.worker_started();

        for _ in 0..95 {
            metrics.record_processed();
        }
        assert!(metrics.healthy());

        for _ in 0..5 {
            metrics.record_error();
        }
        // 5 errors over 95 processed is above the 5 % budget.
        assert!(!metrics.healthy());
    }

    #[test]
    fn exposition_contains_counters() {
        let metrics = MetricsCollector::new(10).unwrap();
        metrics.record_processed();
        let text = metrics.gather().unwrap();
        assert!(text.contains("courier_notifications_processed_total"));
    }
}
