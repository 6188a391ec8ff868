// ============================================================================
// Event ingestion: Kafka consumer, topic demultiplexing, producers
// ============================================================================

pub mod consumer;
pub mod handlers;
pub mod producer;
pub mod types;

pub use consumer::EventIngestor;
pub use producer::EventProducer;

use rdkafka::config::ClientConfig;

use crate::config::KafkaConfig;
use crate::error::DispatchResult;

/// Subscribed domain-event topics.
pub const TOPIC_USER_EVENTS: &str = "user.events";
pub const TOPIC_AUTH_EVENTS: &str = "auth.events";
pub const TOPIC_ORDER_EVENTS: &str = "order.events";
pub const TOPIC_PAYMENT_EVENTS: &str = "payment.events";
/// Bulk ingestion topic.
pub const TOPIC_BULK: &str = "notification.bulk";

pub const SUBSCRIBED_TOPICS: [&str; 5] = [
    TOPIC_USER_EVENTS,
    TOPIC_AUTH_EVENTS,
    TOPIC_ORDER_EVENTS,
    TOPIC_PAYMENT_EVENTS,
    TOPIC_BULK,
];

/// Shared client configuration so consumers and producers are set up
/// consistently: bootstrap servers, TLS, SASL.
pub fn create_client_config(config: &KafkaConfig) -> DispatchResult<ClientConfig> {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);
    client_config.set("security.protocol", "plaintext");

    if config.ssl_enabled {
        client_config.set("security.protocol", "ssl");
    }

    if let (Some(mechanism), Some(username), Some(password)) = (
        &config.sasl_mechanism,
        &config.sasl_username,
        &config.sasl_password,
    ) {
        client_config
            .set("sasl.mechanism", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);
        client_config.set(
            "security.protocol",
            if config.ssl_enabled {
                "sasl_ssl"
            } else {
                "sasl_plaintext"
            },
        );
    }

    Ok(client_config)
}
