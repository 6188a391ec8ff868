use thiserror::Error;
use tonic::{Code, Status};

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Error taxonomy for the dispatch pipeline.
///
/// The variants mirror the propagation policy: resolver reads degrade to
/// empty instead of raising, writes and dispatch failures surface, worker
/// failures are converted to FAILED status and re-raised so the queue can
/// apply its retry policy.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Schema, enum or size violation at an ingress boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The resolver yielded no address or token for the target channel.
    #[error("recipient missing for {channel}: {reason}")]
    RecipientMissing { channel: String, reason: String },

    /// Template substitution failed; callers fall back to raw fields.
    #[error("template render error: {0}")]
    TemplateRender(String),

    /// The channel adapter reported a retryable condition.
    #[error("transient adapter failure: {0}")]
    AdapterTransient(String),

    /// The channel adapter reported a non-retryable condition
    /// (bad token, blacklisted address).
    #[error("permanent adapter failure: {0}")]
    AdapterPermanent(String),

    /// Persistence failure; surfaced to the caller, nothing is enqueued.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// Enqueue failure; surfaced to the caller.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Event payload could not be decoded; skipped and counted.
    #[error("malformed event: {0}")]
    EventMalformed(String),

    #[error("event transport error: {0}")]
    EventTransport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        DispatchError::InvalidArgument(msg.into())
    }

    pub fn recipient_missing(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        DispatchError::RecipientMissing {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        DispatchError::QueueUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DispatchError::Internal(msg.into())
    }

    /// Stable code for logs and job failure records.
    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::InvalidArgument(_) => "INVALID_ARGUMENT",
            DispatchError::RecipientMissing { .. } => "RECIPIENT_MISSING",
            DispatchError::TemplateRender(_) => "TEMPLATE_RENDER",
            DispatchError::AdapterTransient(_) => "ADAPTER_TRANSIENT",
            DispatchError::AdapterPermanent(_) => "ADAPTER_PERMANENT",
            DispatchError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            DispatchError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            DispatchError::EventMalformed(_) => "EVENT_MALFORMED",
            DispatchError::EventTransport(_) => "EVENT_TRANSPORT",
            DispatchError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the queue should reschedule a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DispatchError::AdapterPermanent(_) | DispatchError::InvalidArgument(_)
        )
    }

    pub fn grpc_code(&self) -> Code {
        match self {
            DispatchError::InvalidArgument(_) => Code::InvalidArgument,
            DispatchError::RecipientMissing { .. } => Code::FailedPrecondition,
            DispatchError::StoreUnavailable(_)
            | DispatchError::QueueUnavailable(_)
            | DispatchError::EventTransport(_) => Code::Unavailable,
            _ => Code::Internal,
        }
    }
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        let code = err.grpc_code();
        if code == Code::Internal || code == Code::Unavailable {
            tracing::error!(error = %err, error_code = err.error_code(), "request failed");
        } else {
            tracing::debug!(error = %err, error_code = err.error_code(), "request rejected");
        }
        Status::new(code, err.to_string())
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::QueueUnavailable(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for DispatchError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        DispatchError::EventTransport(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::EventMalformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_failures_are_not_retryable() {
        assert!(!DispatchError::AdapterPermanent("bad token".into()).is_retryable());
        assert!(DispatchError::AdapterTransient("timeout".into()).is_retryable());
        assert!(DispatchError::recipient_missing("PUSH", "no active tokens").is_retryable());
    }

    #[test]
    fn invalid_argument_maps_to_grpc() {
        let status: Status = DispatchError::invalid_argument("title is required").into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
