// ============================================================================
// Dispatcher: request -> persisted notification + queued jobs
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::model::{
    Channel, Notification, NotificationStatus, NotificationType, SendNotificationData,
    UserPreference, MAX_RETRIES,
};
use crate::queue::{ChannelQueues, Job};
use crate::resolver::ChannelResolver;
use crate::store::NotificationStore;

/// Rows fetched per retry pass.
const RETRY_SCAN_LIMIT: i64 = 100;

/// Entry point for every ingress path: persists the notification, applies
/// the preference and type→channel policy, and enqueues one job per target
/// channel.
pub struct Dispatcher {
    store: NotificationStore,
    queues: ChannelQueues,
    resolver: Arc<ChannelResolver>,
}

/// Target-channel policy.
///
/// A pinned channel wins outright. Otherwise the type's default mapping is
/// intersected with the user's enabled channels; a user with no preference
/// rows at all counts as all-enabled and skips the intersection.
pub fn resolve_target_channels(
    pinned: Option<Channel>,
    notification_type: &NotificationType,
    preferences: &[UserPreference],
) -> Vec<Channel> {
    if let Some(channel) = pinned {
        return vec![channel];
    }

    let defaults = notification_type.default_channels();
    if preferences.is_empty() {
        return defaults.to_vec();
    }

    let enabled: HashSet<Channel> = preferences
        .iter()
        .filter(|p| p.is_enabled)
        .map(|p| p.channel)
        .collect();

    defaults
        .iter()
        .copied()
        .filter(|c| enabled.contains(c))
        .collect()
}

impl Dispatcher {
    pub fn new(
        store: NotificationStore,
        queues: ChannelQueues,
        resolver: Arc<ChannelResolver>,
    ) -> Self {
        Self {
            store,
            queues,
            resolver,
        }
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    pub fn queues(&self) -> &ChannelQueues {
        &self.queues
    }

    pub fn resolver(&self) -> &Arc<ChannelResolver> {
        &self.resolver
    }

    /// Validate, persist and fan out a send request.
    ///
    /// Store failures surface before anything is enqueued; an enqueue
    /// failure after the create surfaces too, leaving the row QUEUED and
    /// visible on the non-terminal scan.
    pub async fn dispatch(&self, data: &SendNotificationData) -> DispatchResult<Notification> {
        data.validate()?;

        let notification = self.store.create(data).await?;

        let preferences = self.resolver.preferences(&data.user_id).await;
        let targets = resolve_target_channels(
            data.channel,
            &notification.notification_type,
            &preferences,
        );

        if targets.is_empty() {
            warn!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                notification_type = %notification.notification_type,
                "no enabled channels for notification; nothing enqueued"
            );
            return Ok(notification);
        }

        for channel in &targets {
            let job = Job::for_channel(&notification, *channel);
            self.queues
                .for_channel(*channel)
                .enqueue(&job)
                .await
                .map_err(|e| DispatchError::queue(format!("enqueue on {}: {}", channel, e)))?;
        }

        info!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            notification_type = %notification.notification_type,
            channels = ?targets.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            priority = %notification.priority,
            scheduled = notification.scheduled_at.is_some(),
            "notification dispatched"
        );
        Ok(notification)
    }

    /// Retry pass over FAILED rows still under the retry cap.
    ///
    /// Reuses the original notification id: the row flips back to QUEUED
    /// with its retry count incremented, and one job for the stored channel
    /// re-enters the queue with its attempt budget carried over.
    pub async fn retry_failed(&self) -> DispatchResult<usize> {
        let rows = self
            .store
            .find_failed_for_retry(RETRY_SCAN_LIMIT, MAX_RETRIES)
            .await?;

        let mut requeued = 0usize;
        for row in rows {
            let mut job = Job::for_channel(&row, row.channel);
            job.attempts = row.retry_count.max(0) as u32;

            if let Err(e) = self.queues.for_channel(row.channel).enqueue(&job).await {
                warn!(notification_id = %row.id, error = %e, "retry enqueue failed");
                continue;
            }
            if let Err(e) = self.store.increment_retry(&row.id).await {
                warn!(notification_id = %row.id, error = %e, "retry count update failed");
            }
            if let Err(e) = self
                .store
                .update_status(&row.id, NotificationStatus::Queued, None)
                .await
            {
                warn!(notification_id = %row.id, error = %e, "retry status update failed");
            }
            requeued += 1;
        }

        if requeued > 0 {
            info!(count = requeued, "re-queued failed notifications");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pref(channel: Channel, enabled: bool) -> UserPreference {
        UserPreference {
            user_id: "u".to_string(),
            channel,
            is_enabled: enabled,
        }
    }

    #[test]
    fn pinned_channel_wins_over_preferences() {
        let prefs = vec![pref(Channel::Push, false)];
        let targets =
            resolve_target_channels(Some(Channel::Push), &NotificationType::Welcome, &prefs);
        assert_eq!(targets, vec![Channel::Push]);
    }

    #[test]
    fn no_preference_rows_means_all_enabled() {
        let targets =
            resolve_target_channels(None, &NotificationType::OrderConfirmation, &[]);
        assert_eq!(targets, vec![Channel::Email, Channel::Push]);
    }

    #[test]
    fn disabled_channel_is_dropped() {
        let prefs = vec![pref(Channel::Email, true), pref(Channel::Push, false)];
        let targets =
            resolve_target_channels(None, &NotificationType::OrderConfirmation, &prefs);
        assert_eq!(targets, vec![Channel::Email]);
    }

    #[test]
    fn all_disabled_yields_no_targets() {
        let prefs = vec![
            pref(Channel::Email, false),
            pref(Channel::Push, false),
            pref(Channel::Sms, false),
        ];
        let targets = resolve_target_channels(None, &NotificationType::OrderShipped, &prefs);
        assert!(targets.is_empty());
    }

    #[test]
    fn partial_rows_only_intersect_defaults() {
        // SMS has no row; ORDER_SHIPPED defaults to PUSH+SMS: only explicit
        // enables survive the intersection.
        let prefs = vec![pref(Channel::Push, true)];
        let targets = resolve_target_channels(None, &NotificationType::OrderShipped, &prefs);
        assert_eq!(targets, vec![Channel::Push]);
    }
}
