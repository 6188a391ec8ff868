// ============================================================================
// Data model: notifications, channels, priorities, request payloads
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DispatchError;

/// Hard cap on retries for a single notification.
pub const MAX_RETRIES: i32 = 3;

/// Title length guard applied at every ingress.
pub const MAX_TITLE_LEN: usize = 200;

/// Bulk ingress guard: payloads above this are rejected outright.
pub const MAX_BULK_ITEMS: usize = 10_000;

/// Delivery channel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Push,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Push, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Push => "PUSH",
            Channel::Sms => "SMS",
        }
    }

    /// Redis key segment for this channel's work queue.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "PUSH" => Ok(Channel::Push),
            "SMS" => Ok(Channel::Sms),
            other => Err(DispatchError::invalid_argument(format!(
                "unknown channel: {}",
                other
            ))),
        }
    }
}

/// Dispatch priority. Maps onto an integer queue weight; higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Queue weight used for dequeue ordering: LOW=1, NORMAL=5, HIGH=10, URGENT=20.
    pub fn queue_weight(&self) -> i64 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Urgent => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "URGENT" => Ok(Priority::Urgent),
            other => Err(DispatchError::invalid_argument(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Semantic notification type.
///
/// Unrecognised type strings are accepted (`Custom`) and routed through the
/// default channel mapping, which falls back to EMAIL for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotificationType {
    Welcome,
    PasswordReset,
    EmailVerification,
    OrderConfirmation,
    OrderShipped,
    OrderDelivered,
    PaymentSuccess,
    PaymentFailed,
    Custom(String),
}

impl NotificationType {
    pub fn parse(s: &str) -> Self {
        match s {
            "WELCOME" => NotificationType::Welcome,
            "PASSWORD_RESET" => NotificationType::PasswordReset,
            "EMAIL_VERIFICATION" => NotificationType::EmailVerification,
            "ORDER_CONFIRMATION" => NotificationType::OrderConfirmation,
            "ORDER_SHIPPED" => NotificationType::OrderShipped,
            "ORDER_DELIVERED" => NotificationType::OrderDelivered,
            "PAYMENT_SUCCESS" => NotificationType::PaymentSuccess,
            "PAYMENT_FAILED" => NotificationType::PaymentFailed,
            other => NotificationType::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotificationType::Welcome => "WELCOME",
            NotificationType::PasswordReset => "PASSWORD_RESET",
            NotificationType::EmailVerification => "EMAIL_VERIFICATION",
            NotificationType::OrderConfirmation => "ORDER_CONFIRMATION",
            NotificationType::OrderShipped => "ORDER_SHIPPED",
            NotificationType::OrderDelivered => "ORDER_DELIVERED",
            NotificationType::PaymentSuccess => "PAYMENT_SUCCESS",
            NotificationType::PaymentFailed => "PAYMENT_FAILED",
            NotificationType::Custom(s) => s.as_str(),
        }
    }

    /// Default target channels when the request does not pin one.
    pub fn default_channels(&self) -> &'static [Channel] {
        match self {
            NotificationType::Welcome => &[Channel::Email],
            NotificationType::OrderConfirmation => &[Channel::Email, Channel::Push],
            NotificationType::OrderShipped => &[Channel::Push, Channel::Sms],
            NotificationType::OrderDelivered => &[Channel::Push],
            NotificationType::PaymentSuccess => &[Channel::Email],
            NotificationType::PaymentFailed => &[Channel::Email, Channel::Push],
            NotificationType::PasswordReset => &[Channel::Email],
            NotificationType::EmailVerification => &[Channel::Email],
            NotificationType::Custom(_) => &[Channel::Email],
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NotificationType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NotificationType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(NotificationType::parse(&s))
    }
}

/// Lifecycle state of a notification.
///
/// Advances monotonically except that FAILED may re-enter QUEUED through the
/// retry pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Queued,
    Processing,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Queued => "QUEUED",
            NotificationStatus::Processing => "PROCESSING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(NotificationStatus::Queued),
            "PROCESSING" => Ok(NotificationStatus::Processing),
            "SENT" => Ok(NotificationStatus::Sent),
            "FAILED" => Ok(NotificationStatus::Failed),
            other => Err(DispatchError::internal(format!(
                "unknown notification status in store: {}",
                other
            ))),
        }
    }
}

pub type Metadata = HashMap<String, serde_json::Value>;

/// The persisted unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub notification_type: NotificationType,
    /// Intended channel when the request pinned one, EMAIL by default.
    pub channel: Channel,
    pub title: String,
    pub message: String,
    pub metadata: Option<Metadata>,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Validated dispatch input, shared by every ingress path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendNotificationData {
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SendNotificationData {
    pub fn new(
        user_id: impl Into<String>,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            notification_type,
            title: title.into(),
            message: message.into(),
            channel: None,
            priority: None,
            metadata: None,
            scheduled_at: None,
        }
    }

    /// Ingress validation shared by the RPC surface and the event ingestor.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.user_id.trim().is_empty() {
            return Err(DispatchError::invalid_argument("userId is required"));
        }
        if self.title.trim().is_empty() {
            return Err(DispatchError::invalid_argument("title is required"));
        }
        if self.message.trim().is_empty() {
            return Err(DispatchError::invalid_argument("message is required"));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(DispatchError::invalid_argument(format!(
                "title exceeds {} characters",
                MAX_TITLE_LEN
            )));
        }
        // The stored row must satisfy scheduledAt >= createdAt, and createdAt
        // is assigned at persist time; past instants can never hold it.
        if let Some(scheduled_at) = self.scheduled_at {
            if scheduled_at < Utc::now() {
                return Err(DispatchError::invalid_argument(
                    "scheduledAt must not be in the past",
                ));
            }
        }
        Ok(())
    }
}

/// Per-user channel opt-in/opt-out row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    pub user_id: String,
    pub channel: Channel,
    pub is_enabled: bool,
}

/// Registered push target. Only active tokens receive fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub user_id: String,
    pub token: String,
    pub platform: String,
    pub is_active: bool,
}

/// Stored content template for a (type, channel) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTemplate {
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub title: String,
    pub message: String,
    pub html_content: Option<String>,
}

/// Read-only projection of the user system-of-record.
#[derive(Debug, Clone)]
pub struct UserContact {
    pub user_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

// ============================================================================
// Admin request schemas
// ============================================================================

/// `UpdatePreferencesDto { channel, isEnabled }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferencesDto {
    pub channel: Channel,
    pub is_enabled: bool,
}

/// `DeviceTokenDto { token, platform }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenDto {
    pub token: String,
    pub platform: String,
}

impl DeviceTokenDto {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.token.is_empty() || self.token.len() > 256 {
            return Err(DispatchError::invalid_argument(
                "device token format is invalid",
            ));
        }
        if self.platform.trim().is_empty() {
            return Err(DispatchError::invalid_argument("platform is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_queue_weights() {
        assert_eq!(Priority::Low.queue_weight(), 1);
        assert_eq!(Priority::Normal.queue_weight(), 5);
        assert_eq!(Priority::High.queue_weight(), 10);
        assert_eq!(Priority::Urgent.queue_weight(), 20);
    }

    #[test]
    fn unknown_type_routes_to_email() {
        let ty = NotificationType::parse("SOMETHING_NEW");
        assert_eq!(ty, NotificationType::Custom("SOMETHING_NEW".to_string()));
        assert_eq!(ty.default_channels(), &[Channel::Email]);
    }

    #[test]
    fn default_channel_table() {
        assert_eq!(
            NotificationType::OrderShipped.default_channels(),
            &[Channel::Push, Channel::Sms]
        );
        assert_eq!(
            NotificationType::PaymentFailed.default_channels(),
            &[Channel::Email, Channel::Push]
        );
        assert_eq!(
            NotificationType::Welcome.default_channels(),
            &[Channel::Email]
        );
    }

    #[test]
    fn title_length_guard() {
        let mut data = SendNotificationData::new("u1", NotificationType::Welcome, "t", "m");
        assert!(data.validate().is_ok());

        data.title = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(data.validate().is_err());

        data.title = "x".repeat(MAX_TITLE_LEN);
        assert!(data.validate().is_ok());
    }

    #[test]
    fn past_schedule_is_rejected() {
        let mut data = SendNotificationData::new("u1", NotificationType::Welcome, "t", "m");

        data.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(60));
        assert!(data.validate().is_err());

        data.scheduled_at = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(data.validate().is_ok());
    }

    #[test]
    fn device_token_dto_guards() {
        let dto: DeviceTokenDto =
            serde_json::from_str(r#"{"token":"tok-1","platform":"ios"}"#).unwrap();
        assert!(dto.validate().is_ok());

        let empty = DeviceTokenDto {
            token: String::new(),
            platform: "ios".to_string(),
        };
        assert!(empty.validate().is_err());

        let oversized = DeviceTokenDto {
            token: "x".repeat(257),
            platform: "ios".to_string(),
        };
        assert!(oversized.validate().is_err());
    }

    #[test]
    fn preferences_dto_parses_camel_case() {
        let dto: UpdatePreferencesDto =
            serde_json::from_str(r#"{"channel":"PUSH","isEnabled":false}"#).unwrap();
        assert_eq!(dto.channel, Channel::Push);
        assert!(!dto.is_enabled);
    }

    #[test]
    fn send_data_round_trips_as_camel_case() {
        let json = r#"{
            "userId": "u7",
            "type": "ORDER_CONFIRMATION",
            "title": "Order placed",
            "message": "Thanks!",
            "priority": "HIGH",
            "metadata": {"orderId": "o-1"}
        }"#;
        let data: SendNotificationData = serde_json::from_str(json).unwrap();
        assert_eq!(data.user_id, "u7");
        assert_eq!(data.notification_type, NotificationType::OrderConfirmation);
        assert_eq!(data.priority, Some(Priority::High));
        assert!(data.channel.is_none());
    }
}
