use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Channel, Metadata, Notification, NotificationType};

/// Unit of queued work: one job per (notification, target channel).
///
/// Carries enough content to deliver without another store read; the queue
/// control fields (`priority`, `delay_until`, `attempts`) drive dequeue
/// ordering and the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub notification_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Integer queue weight mapped from the request priority; higher wins.
    pub priority: i64,
    /// The job is not dequeueable before this instant.
    pub delay_until: DateTime<Utc>,
    /// Completed delivery attempts so far.
    pub attempts: u32,
}

impl Job {
    /// Build the job for one target channel of a stored notification.
    /// `delay_until` is `max(now, scheduledAt)`.
    pub fn for_channel(notification: &Notification, channel: Channel) -> Self {
        let now = Utc::now();
        let delay_until = match notification.scheduled_at {
            Some(at) if at > now => at,
            _ => now,
        };
        Self {
            notification_id: notification.id.clone(),
            user_id: notification.user_id.clone(),
            notification_type: notification.notification_type.clone(),
            channel,
            title: notification.title.clone(),
            message: notification.message.clone(),
            metadata: notification.metadata.clone(),
            priority: notification.priority.queue_weight(),
            delay_until,
            attempts: 0,
        }
    }
}

/// Failure record kept on the per-queue history list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use chrono::Duration;

    fn notification(priority: Priority, scheduled_at: Option<DateTime<Utc>>) -> Notification {
        let now = Utc::now();
        Notification {
            id: "n-1".into(),
            user_id: "u-1".into(),
            notification_type: NotificationType::PaymentFailed,
            channel: Channel::Email,
            title: "t".into(),
            message: "m".into(),
            metadata: None,
            priority,
            scheduled_at,
            status: crate::model::NotificationStatus::Queued,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            failed_at: None,
        }
    }

    #[test]
    fn urgent_maps_to_weight_20() {
        let job = Job::for_channel(&notification(Priority::Urgent, None), Channel::Email);
        assert_eq!(job.priority, 20);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn delay_until_is_max_of_now_and_schedule() {
        let future = Utc::now() + Duration::seconds(30);
        let job = Job::for_channel(&notification(Priority::Normal, Some(future)), Channel::Email);
        assert_eq!(job.delay_until, future);

        let past = Utc::now() - Duration::seconds(30);
        let job = Job::for_channel(&notification(Priority::Normal, Some(past)), Channel::Email);
        assert!(job.delay_until >= past + Duration::seconds(29));
    }

    #[test]
    fn job_serializes_camel_case() {
        let job = Job::for_channel(&notification(Priority::High, None), Channel::Sms);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"notificationId\""));
        assert!(json.contains("\"delayUntil\""));
        assert!(json.contains("\"type\":\"PAYMENT_FAILED\""));
    }
}
