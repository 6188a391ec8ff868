use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, DispatchResult};
use crate::metrics::MetricsCollector;

use super::handlers::{action_for_event, handle_bulk};
use super::types::{BulkMessage, DomainEvent};
use super::{create_client_config, SUBSCRIBED_TOPICS, TOPIC_BULK};

/// Kafka consumer feeding the dispatcher.
///
/// Offsets are committed when a message was handled or deliberately
/// skipped; handler failures leave the offset untouched so the transport
/// redelivers.
pub struct EventIngestor {
    consumer: StreamConsumer,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsCollector>,
}

enum HandleResult {
    Handled,
    Skipped,
    Failed,
}

impl EventIngestor {
    /// Consumer configuration: 30 s session timeout, 3 s heartbeat, 100 ms
    /// max fetch wait, 4 MiB per partition, 1 MiB per fetch.
    pub fn new(
        config: &KafkaConfig,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<MetricsCollector>,
    ) -> DispatchResult<Self> {
        let consumer: StreamConsumer = create_client_config(config)?
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("fetch.wait.max.ms", "100")
            .set("max.partition.fetch.bytes", "4194304")
            .set("fetch.max.bytes", "1048576")
            .create()
            .map_err(|e| DispatchError::EventTransport(format!("consumer init: {}", e)))?;

        consumer
            .subscribe(&SUBSCRIBED_TOPICS)
            .map_err(|e| DispatchError::EventTransport(format!("subscribe: {}", e)))?;

        info!(
            group = %config.consumer_group,
            topics = ?SUBSCRIBED_TOPICS,
            "event ingestor subscribed"
        );

        Ok(Self {
            consumer,
            dispatcher,
            metrics,
        })
    }

    /// Consume until shutdown flips, then drain the in-flight handler and
    /// disconnect.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event ingestor stopping");
                        break;
                    }
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            let result = self.handle_message(&message).await;
                            match result {
                                HandleResult::Handled | HandleResult::Skipped => {
                                    if let Err(e) = self
                                        .consumer
                                        .commit_message(&message, CommitMode::Async)
                                    {
                                        warn!(error = %e, "offset commit failed");
                                    }
                                }
                                HandleResult::Failed => {
                                    // Leave the offset; the transport redelivers.
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "consumer error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: &BorrowedMessage<'_>) -> HandleResult {
        let topic = message.topic().to_string();
        let payload = match message.payload() {
            Some(payload) if !payload.is_empty() => payload,
            _ => {
                self.metrics.record_malformed_event();
                warn!(topic = %topic, "empty event payload, skipping");
                return HandleResult::Skipped;
            }
        };

        if topic == TOPIC_BULK {
            return self.handle_bulk_payload(payload).await;
        }

        let event: DomainEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_malformed_event();
                warn!(topic = %topic, error = %e, "malformed event, skipping");
                return HandleResult::Skipped;
            }
        };

        let action = match action_for_event(&topic, &event) {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(topic = %topic, event_type = %event.event_type, "event is a no-op");
                return HandleResult::Skipped;
            }
            Err(e) => {
                self.metrics.record_malformed_event();
                warn!(topic = %topic, event_type = %event.event_type, error = %e, "unusable event, skipping");
                return HandleResult::Skipped;
            }
        };

        match self.dispatcher.dispatch(&action).await {
            Ok(notification) => {
                debug!(
                    topic = %topic,
                    event_type = %event.event_type,
                    notification_id = %notification.id,
                    "event dispatched"
                );
                HandleResult::Handled
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    event_type = %event.event_type,
                    error = %e,
                    "event dispatch failed, will be redelivered"
                );
                HandleResult::Failed
            }
        }
    }

    async fn handle_bulk_payload(&self, payload: &[u8]) -> HandleResult {
        let bulk: BulkMessage = match serde_json::from_slice(payload) {
            Ok(bulk) => bulk,
            Err(e) => {
                self.metrics.record_malformed_event();
                warn!(error = %e, "malformed bulk message, skipping");
                return HandleResult::Skipped;
            }
        };

        if bulk.bulk_notifications.is_empty() {
            self.metrics.record_malformed_event();
            warn!(batch_id = %bulk.batch_id, "bulk message carries no notifications, skipping");
            return HandleResult::Skipped;
        }

        // Per-notification failures are isolated inside the batch and do
        // not hold the offset back.
        let _ = handle_bulk(&self.dispatcher, bulk).await;
        HandleResult::Handled
    }
}
