// ============================================================================
// Channel Resolver: recipient lookup, preferences, device tokens, templates
// ============================================================================

use std::sync::Arc;
use tracing::warn;

use crate::error::DispatchResult;
use crate::model::{Channel, DeviceToken, NotificationTemplate, NotificationType, UserPreference};
use crate::store::NotificationStore;
use crate::template::TemplateCache;

/// Resolved delivery target for one channel.
#[derive(Debug, Clone)]
pub enum Recipient {
    Email(String),
    Phone(String),
    Tokens(Vec<DeviceToken>),
}

impl Recipient {
    pub fn is_empty(&self) -> bool {
        match self {
            Recipient::Email(addr) => addr.is_empty(),
            Recipient::Phone(phone) => phone.is_empty(),
            Recipient::Tokens(tokens) => tokens.is_empty(),
        }
    }
}

/// Read side of the user-facing configuration: addresses, tokens,
/// preferences and templates.
///
/// Reads swallow errors down to `None`/empty so a lookup failure never
/// prevents a caller from choosing a fallback; writes surface.
pub struct ChannelResolver {
    store: NotificationStore,
    template_cache: Arc<TemplateCache>,
}

impl ChannelResolver {
    pub fn new(store: NotificationStore) -> Self {
        Self {
            store,
            template_cache: Arc::new(TemplateCache::new()),
        }
    }

    /// EMAIL → email-or-none, SMS → phone-or-none, PUSH → active tokens
    /// (possibly empty).
    pub async fn recipient(&self, user_id: &str, channel: Channel) -> Option<Recipient> {
        match channel {
            Channel::Email => match self.store.user_contact(user_id).await {
                Ok(contact) => contact.and_then(|c| c.email).map(Recipient::Email),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "email lookup failed");
                    None
                }
            },
            Channel::Sms => match self.store.user_contact(user_id).await {
                Ok(contact) => contact.and_then(|c| c.phone).map(Recipient::Phone),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "phone lookup failed");
                    None
                }
            },
            Channel::Push => match self.store.active_device_tokens(user_id).await {
                Ok(tokens) => Some(Recipient::Tokens(tokens)),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "device token lookup failed");
                    Some(Recipient::Tokens(Vec::new()))
                }
            },
        }
    }

    /// All preference rows for a user; empty on lookup failure.
    pub async fn preferences(&self, user_id: &str) -> Vec<UserPreference> {
        match self.store.preferences(user_id).await {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "preference lookup failed");
                Vec::new()
            }
        }
    }

    pub async fn upsert_preference(
        &self,
        user_id: &str,
        channel: Channel,
        enabled: bool,
    ) -> DispatchResult<()> {
        self.store
            .upsert_preference(user_id, channel, enabled)
            .await
    }

    pub async fn upsert_device_token(
        &self,
        user_id: &str,
        token: &str,
        platform: &str,
    ) -> DispatchResult<()> {
        self.store
            .upsert_device_token(user_id, token, platform)
            .await
    }

    pub async fn deactivate_device_token(&self, user_id: &str, token: &str) -> DispatchResult<()> {
        self.store.deactivate_device_token(user_id, token).await
    }

    /// Cache-first template lookup. A store miss is cached as nothing; a hit
    /// is inserted and refreshes LRU position on subsequent lookups.
    pub async fn template(
        &self,
        notification_type: &NotificationType,
        channel: Channel,
    ) -> Option<NotificationTemplate> {
        if let Some(tpl) = self.template_cache.get(notification_type, channel).await {
            return Some(tpl);
        }

        match self.store.active_template(notification_type, channel).await {
            Ok(Some(tpl)) => {
                self.template_cache.insert(tpl.clone()).await;
                Some(tpl)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    notification_type = %notification_type,
                    channel = %channel,
                    error = %e,
                    "template lookup failed"
                );
                None
            }
        }
    }
}
