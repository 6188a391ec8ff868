use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::KafkaConfig;
use crate::error::{DispatchError, DispatchResult};

use super::create_client_config;

/// Kafka producer shared by the SMS adapter, the bulk-optimized ingress and
/// internal event publication.
///
/// Configured for at-least-once delivery: idempotence on, acks from all
/// in-sync replicas, bounded in-flight window.
pub struct EventProducer {
    producer: Arc<FutureProducer>,
}

impl EventProducer {
    pub fn new(config: &KafkaConfig) -> DispatchResult<Self> {
        let producer: FutureProducer = create_client_config(config)?
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set("retries", "8")
            .set("retry.backoff.ms", "100")
            .set("transaction.timeout.ms", "30000")
            .set("request.timeout.ms", "30000")
            .create()
            .map_err(|e| DispatchError::EventTransport(format!("producer init: {}", e)))?;

        info!(brokers = %config.brokers, "Kafka producer initialized");

        Ok(Self {
            producer: Arc::new(producer),
        })
    }

    /// Publish a JSON payload. The partition key is the payload's user id
    /// when present, otherwise its own id, otherwise a literal fallback.
    pub async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> DispatchResult<(i32, i64)> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self
            .producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
        {
            Ok(delivery) => Ok(delivery),
            Err((kafka_err, _)) => {
                error!(error = %kafka_err, topic = %topic, "Kafka publish failed");
                Err(DispatchError::EventTransport(format!(
                    "publish to {} failed: {}",
                    topic, kafka_err
                )))
            }
        }
    }

    /// Wait for in-flight messages to be acknowledged; called on shutdown.
    pub fn flush(&self, timeout: Duration) -> DispatchResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| DispatchError::EventTransport(format!("flush failed: {}", e)))
    }
}

impl Clone for EventProducer {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

/// Partition key selection: `userId` of the payload, or the payload id, or a
/// literal fallback.
pub fn partition_key<'a>(user_id: Option<&'a str>, payload_id: Option<&'a str>) -> &'a str {
    user_id
        .filter(|s| !s.is_empty())
        .or(payload_id.filter(|s| !s.is_empty()))
        .unwrap_or("notification")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_prefers_user_id() {
        assert_eq!(partition_key(Some("u1"), Some("p1")), "u1");
        assert_eq!(partition_key(None, Some("p1")), "p1");
        assert_eq!(partition_key(Some(""), None), "notification");
    }
}
