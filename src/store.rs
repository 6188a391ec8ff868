// ============================================================================
// Notification Store: persistence for notifications, preferences,
// device tokens and templates
// ============================================================================

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{DispatchError, DispatchResult};
use crate::model::{
    Channel, DeviceToken, Metadata, Notification, NotificationStatus, NotificationTemplate,
    NotificationType, Priority, SendNotificationData, UserContact, UserPreference,
};

/// Persistence layer for the four entity kinds.
///
/// Status updates go through single-row UPDATE statements so concurrent
/// transitions to the same notification serialise on the row lock.
#[derive(Clone)]
pub struct NotificationStore {
    pool: DbPool,
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: String,
    user_id: String,
    #[sqlx(rename = "type")]
    notification_type: String,
    channel: String,
    title: String,
    message: String,
    metadata: Option<serde_json::Value>,
    priority: String,
    scheduled_at: Option<DateTime<Utc>>,
    status: String,
    retry_count: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl NotificationRow {
    fn into_notification(self) -> DispatchResult<Notification> {
        let metadata: Option<Metadata> = match self.metadata {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| DispatchError::internal(format!("corrupt metadata column: {}", e)))?,
            None => None,
        };
        Ok(Notification {
            id: self.id,
            user_id: self.user_id,
            notification_type: NotificationType::parse(&self.notification_type),
            channel: Channel::from_str(&self.channel)?,
            title: self.title,
            message: self.message,
            metadata,
            priority: Priority::from_str(&self.priority)?,
            scheduled_at: self.scheduled_at,
            status: NotificationStatus::from_str(&self.status)?,
            retry_count: self.retry_count,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sent_at: self.sent_at,
            failed_at: self.failed_at,
        })
    }
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, type, channel, title, message, metadata, \
     priority, scheduled_at, status, retry_count, error_message, \
     created_at, updated_at, sent_at, failed_at";

impl NotificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a new notification: fresh id, QUEUED, retry_count 0.
    pub async fn create(&self, data: &SendNotificationData) -> DispatchResult<Notification> {
        let id = Uuid::new_v4().to_string();
        let channel = data.channel.unwrap_or(Channel::Email);
        let priority = data.priority.unwrap_or_default();
        let metadata_json = match &data.metadata {
            Some(map) => Some(
                serde_json::to_value(map)
                    .map_err(|e| DispatchError::internal(format!("metadata encode: {}", e)))?,
            ),
            None => None,
        };

        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            INSERT INTO notifications
                (id, user_id, type, channel, title, message, metadata, priority,
                 scheduled_at, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'QUEUED', 0)
            RETURNING {}
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(&id)
        .bind(&data.user_id)
        .bind(data.notification_type.as_str())
        .bind(channel.as_str())
        .bind(&data.title)
        .bind(&data.message)
        .bind(metadata_json)
        .bind(priority.as_str())
        .bind(data.scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_notification()
    }

    pub async fn get(&self, id: &str) -> DispatchResult<Option<Notification>> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE id = $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NotificationRow::into_notification).transpose()
    }

    /// Atomic status transition. Sets `sent_at` when the new status is SENT,
    /// `failed_at` + `error_message` when FAILED, and always bumps
    /// `updated_at`.
    pub async fn update_status(
        &self,
        id: &str,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> DispatchResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                error_message = CASE WHEN $2 = 'FAILED' THEN $3 ELSE error_message END,
                sent_at       = CASE WHEN $2 = 'SENT' THEN NOW() ELSE sent_at END,
                failed_at     = CASE WHEN $2 = 'FAILED' THEN NOW() ELSE failed_at END,
                updated_at    = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::internal(format!(
                "status update for unknown notification {}",
                id
            )));
        }
        Ok(())
    }

    /// FAILED rows still under the retry cap, oldest failure first.
    pub async fn find_failed_for_retry(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> DispatchResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {}
            FROM notifications
            WHERE status = 'FAILED' AND retry_count < $2
            ORDER BY failed_at ASC
            LIMIT $1
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(limit)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }

    /// Atomic retry-count bump, saturating at the retry cap so the
    /// `retry_count <= MAX_RETRIES` invariant holds under any interleaving
    /// of queue-level and scan-level retries.
    pub async fn increment_retry(&self, id: &str) -> DispatchResult<()> {
        sqlx::query(
            "UPDATE notifications SET retry_count = LEAST(retry_count + 1, $2), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(crate::model::MAX_RETRIES)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete terminal notifications older than the retention window.
    /// Returns the number of rows removed.
    pub async fn delete_terminal_older_than(&self, days: i64) -> DispatchResult<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE created_at < $1
              AND (status = 'SENT' OR (status = 'FAILED' AND retry_count >= $2))
            "#,
        )
        .bind(cutoff)
        .bind(crate::model::MAX_RETRIES)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    pub async fn preferences(&self, user_id: &str) -> DispatchResult<Vec<UserPreference>> {
        let rows = sqlx::query(
            "SELECT user_id, channel, is_enabled FROM user_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut prefs = Vec::with_capacity(rows.len());
        for row in rows {
            prefs.push(UserPreference {
                user_id: row.get("user_id"),
                channel: Channel::from_str(row.get::<String, _>("channel").as_str())?,
                is_enabled: row.get("is_enabled"),
            });
        }
        Ok(prefs)
    }

    pub async fn upsert_preference(
        &self,
        user_id: &str,
        channel: Channel,
        is_enabled: bool,
    ) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, channel, is_enabled)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, channel)
            DO UPDATE SET is_enabled = EXCLUDED.is_enabled, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(is_enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Device tokens
    // ========================================================================

    pub async fn active_device_tokens(&self, user_id: &str) -> DispatchResult<Vec<DeviceToken>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, token, platform, is_active
            FROM device_tokens
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeviceToken {
                user_id: row.get("user_id"),
                token: row.get("token"),
                platform: row.get("platform"),
                is_active: row.get("is_active"),
            })
            .collect())
    }

    /// Registration upsert: conflict reactivates the token and refreshes
    /// the platform tag.
    pub async fn upsert_device_token(
        &self,
        user_id: &str,
        token: &str,
        platform: &str,
    ) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_tokens (user_id, token, platform, is_active)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (user_id, token)
            DO UPDATE SET platform = EXCLUDED.platform, is_active = TRUE, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(platform)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate_device_token(&self, user_id: &str, token: &str) -> DispatchResult<()> {
        sqlx::query(
            r#"
            UPDATE device_tokens
            SET is_active = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND token = $2
            "#,
        )
        .bind(user_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Templates and user contacts
    // ========================================================================

    pub async fn active_template(
        &self,
        notification_type: &NotificationType,
        channel: Channel,
    ) -> DispatchResult<Option<NotificationTemplate>> {
        let row = sqlx::query(
            r#"
            SELECT type, channel, title, message, html_content
            FROM notification_templates
            WHERE type = $1 AND channel = $2 AND is_active = TRUE
            "#,
        )
        .bind(notification_type.as_str())
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(NotificationTemplate {
                notification_type: NotificationType::parse(
                    row.get::<String, _>("type").as_str(),
                ),
                channel: Channel::from_str(row.get::<String, _>("channel").as_str())?,
                title: row.get("title"),
                message: row.get("message"),
                html_content: row.get("html_content"),
            })),
            None => Ok(None),
        }
    }

    pub async fn user_contact(&self, user_id: &str) -> DispatchResult<Option<UserContact>> {
        let row = sqlx::query("SELECT id, email, phone FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| UserContact {
            user_id: row.get("id"),
            email: row.get("email"),
            phone: row.get("phone"),
        }))
    }
}
