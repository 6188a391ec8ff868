use anyhow::Result;

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_GRPC_PORT: u16 = 50051;

// Queue policy defaults (seconds unless noted)
const DEFAULT_STALLED_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_STALLED_COUNT: u32 = 1;
const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_JOB_ATTEMPTS: u32 = 3;

// Worker defaults
const DEFAULT_WORKERS_PER_CHANNEL: usize = 4;
const DEFAULT_ADAPTER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

// Metrics sampling
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 10;
const DEFAULT_SAMPLE_WINDOW: usize = 100;

// Cleanup: terminal notifications older than this are eligible for deletion
const DEFAULT_RETENTION_DAYS: i64 = 30;

// Background cadences
const DEFAULT_RETRY_SCAN_INTERVAL_SECS: u64 = 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;

// Graceful shutdown drain deadline
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

// Bulk chunking knobs: the producer publishes chunks of PRODUCER_CHUNK to the
// bulk topic; the consumer re-partitions each chunk into CONSUMER_SUBBATCH
// dispatch groups.
pub const PRODUCER_CHUNK: usize = 1_000;
pub const CONSUMER_SUBBATCH: usize = 100;

// ============================================================================
// Configuration Structures
// ============================================================================

/// Database connection pool configuration
#[derive(Clone, Debug)]
pub struct DbConfig {
    pub url: String,
    /// Pool size; deployment guidance is 5-20.
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// Redis connection for the channel work queues
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Pool guidance 10-50; ConnectionManager multiplexes over one socket.
    pub pool_size: u32,
    /// Prefix for every queue key, e.g. "courier:queue:".
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Kafka configuration for the event ingestor and producers
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub ssl_enabled: bool,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Carrier topic the SMS adapter publishes to.
    pub sms_topic: String,
    /// Bulk ingestion topic.
    pub bulk_topic: String,
}

/// SMTP transport configuration for the email adapter
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_email: String,
    pub from_name: String,
    pub use_tls: bool,
}

/// APNs push configuration
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub enabled: bool,
    /// Path to the .p8 authentication key file.
    pub key_path: String,
    pub key_id: String,
    pub team_id: String,
    pub topic: String,
    pub production: bool,
}

/// RPC listener configuration
#[derive(Clone, Debug)]
pub struct GrpcConfig {
    pub port: u16,
    /// Upper bound on concurrent requests; deployment guidance is up to 100.
    pub concurrency_limit: usize,
}

/// Worker pool and queue policy configuration
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub workers_per_channel: usize,
    pub adapter_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stalled_interval_secs: u64,
    pub max_stalled_count: u32,
    pub retry_backoff_base_ms: u64,
    pub max_attempts: u32,
}

/// Metrics sampling configuration
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub sample_interval_secs: u64,
    pub sample_window: usize,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub db: DbConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub smtp: SmtpConfig,
    pub push: PushConfig,
    pub grpc: GrpcConfig,
    pub worker: WorkerConfig,
    pub metrics: MetricsConfig,
    pub retention_days: i64,
    pub retry_scan_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub rust_log: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            db: DbConfig {
                url: std::env::var("DATABASE_URL")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20),
                acquire_timeout_secs: env_or("DATABASE_ACQUIRE_TIMEOUT_SECS", 30),
            },
            redis: RedisConfig {
                host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_or("REDIS_PORT", 6379),
                password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
                db: env_or("REDIS_DB", 0),
                pool_size: env_or("REDIS_POOL_SIZE", 50),
                key_prefix: std::env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "courier:queue:".to_string()),
            },
            kafka: KafkaConfig {
                brokers: std::env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| "localhost:9092".to_string()),
                consumer_group: std::env::var("KAFKA_CONSUMER_GROUP")
                    .unwrap_or_else(|_| "courier-dispatchers".to_string()),
                ssl_enabled: env_or("KAFKA_SSL_ENABLED", false),
                sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
                sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
                sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
                sms_topic: std::env::var("SMS_TOPIC")
                    .unwrap_or_else(|_| "sms.outbound".to_string()),
                bulk_topic: std::env::var("BULK_TOPIC")
                    .unwrap_or_else(|_| "notification.bulk".to_string()),
            },
            smtp: SmtpConfig {
                host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_or("SMTP_PORT", 587),
                username: std::env::var("SMTP_USERNAME").ok(),
                password: std::env::var("SMTP_PASSWORD").ok(),
                from_email: std::env::var("SMTP_FROM_EMAIL")
                    .unwrap_or_else(|_| "noreply@localhost".to_string()),
                from_name: std::env::var("SMTP_FROM_NAME")
                    .unwrap_or_else(|_| "Courier".to_string()),
                use_tls: env_or("SMTP_USE_TLS", true),
            },
            push: PushConfig {
                enabled: env_or("PUSH_ENABLED", false),
                key_path: std::env::var("PUSH_KEY_PATH").unwrap_or_default(),
                key_id: std::env::var("PUSH_KEY_ID").unwrap_or_default(),
                team_id: std::env::var("PUSH_TEAM_ID").unwrap_or_default(),
                topic: std::env::var("PUSH_TOPIC").unwrap_or_default(),
                production: env_or("PUSH_PRODUCTION", false),
            },
            grpc: GrpcConfig {
                port: env_or("GRPC_PORT", DEFAULT_GRPC_PORT),
                concurrency_limit: env_or("GRPC_CONCURRENCY_LIMIT", 100),
            },
            worker: WorkerConfig {
                workers_per_channel: env_or("WORKERS_PER_CHANNEL", DEFAULT_WORKERS_PER_CHANNEL),
                adapter_timeout_secs: env_or("ADAPTER_TIMEOUT_SECS", DEFAULT_ADAPTER_TIMEOUT_SECS),
                poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
                stalled_interval_secs: env_or("STALLED_INTERVAL_SECS", DEFAULT_STALLED_INTERVAL_SECS),
                max_stalled_count: env_or("MAX_STALLED_COUNT", DEFAULT_MAX_STALLED_COUNT),
                retry_backoff_base_ms: env_or("RETRY_BACKOFF_BASE_MS", DEFAULT_RETRY_BACKOFF_BASE_MS),
                max_attempts: env_or("JOB_MAX_ATTEMPTS", DEFAULT_JOB_ATTEMPTS),
            },
            metrics: MetricsConfig {
                sample_interval_secs: env_or("METRICS_SAMPLE_INTERVAL_SECS", DEFAULT_SAMPLE_INTERVAL_SECS),
                sample_window: env_or("METRICS_SAMPLE_WINDOW", DEFAULT_SAMPLE_WINDOW),
            },
            retention_days: env_or("NOTIFICATION_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            retry_scan_interval_secs: env_or("RETRY_SCAN_INTERVAL_SECS", DEFAULT_RETRY_SCAN_INTERVAL_SECS),
            cleanup_interval_secs: env_or("CLEANUP_INTERVAL_SECS", DEFAULT_CLEANUP_INTERVAL_SECS),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_with_and_without_password() {
        let mut cfg = RedisConfig {
            host: "10.0.0.2".to_string(),
            port: 6380,
            password: None,
            db: 1,
            pool_size: 10,
            key_prefix: "courier:queue:".to_string(),
        };
        assert_eq!(cfg.url(), "redis://10.0.0.2:6380/1");

        cfg.password = Some("s3cret".to_string());
        assert_eq!(cfg.url(), "redis://:s3cret@10.0.0.2:6380/1");
    }
}
