// ============================================================================
// Template cache and renderer
// ============================================================================

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::model::{Channel, Metadata, NotificationTemplate, NotificationType};

/// Cache capacity; the least-recently-used entry is evicted on overflow.
pub const CACHE_CAPACITY: usize = 500;

/// Entries older than this are treated as misses.
pub const CACHE_TTL_SECS: i64 = 300;

type CacheKey = (NotificationType, Channel);

struct CacheEntry {
    template: NotificationTemplate,
    inserted_at: DateTime<Utc>,
    last_used: u64,
}

/// Bounded LRU+TTL cache for active templates.
///
/// Owned by the Channel Resolver; lookups refresh recency, misses are filled
/// by the resolver from the store.
pub struct TemplateCache {
    entries: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

struct CacheState {
    map: HashMap<CacheKey, CacheEntry>,
    clock: u64,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY, CACHE_TTL_SECS)
    }

    pub fn with_capacity(capacity: usize, ttl_secs: i64) -> Self {
        Self {
            entries: Mutex::new(CacheState {
                map: HashMap::new(),
                clock: 0,
            }),
            capacity,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub async fn get(
        &self,
        notification_type: &NotificationType,
        channel: Channel,
    ) -> Option<NotificationTemplate> {
        let key = (notification_type.clone(), channel);
        let mut state = self.entries.lock().await;

        let expired = match state.map.get(&key) {
            Some(entry) => Utc::now() - entry.inserted_at > self.ttl,
            None => return None,
        };
        if expired {
            state.map.remove(&key);
            return None;
        }

        state.clock += 1;
        let clock = state.clock;
        let entry = state.map.get_mut(&key)?;
        entry.last_used = clock;
        Some(entry.template.clone())
    }

    pub async fn insert(&self, template: NotificationTemplate) {
        let key = (template.notification_type.clone(), template.channel);
        let mut state = self.entries.lock().await;
        state.clock += 1;
        let clock = state.clock;

        if state.map.len() >= self.capacity && !state.map.contains_key(&key) {
            // Evict the least-recently-used entry.
            if let Some(lru_key) = state
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                state.map.remove(&lru_key);
            }
        }

        state.map.insert(
            key,
            CacheEntry {
                template,
                inserted_at: Utc::now(),
                last_used: clock,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.map.len()
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Rendered content for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub title: String,
    pub message: String,
    pub html_content: Option<String>,
}

/// Substitute `{{name}}` tokens in every template field.
///
/// Unknown tokens are left in place; rendering never fails. String values
/// are inserted verbatim, everything else via its JSON form.
pub fn render(template: &NotificationTemplate, variables: &Metadata) -> RenderedContent {
    RenderedContent {
        title: substitute(&template.title, variables),
        message: substitute(&template.message, variables),
        html_content: template
            .html_content
            .as_ref()
            .map(|html| substitute(html, variables)),
    }
}

fn substitute(input: &str, variables: &Metadata) -> String {
    let mut out = input.to_string();
    for (name, value) in variables {
        let token = format!("{{{{{}}}}}", name);
        if !out.contains(token.as_str()) {
            continue;
        }
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(token.as_str(), &rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(title: &str, message: &str, html: Option<&str>) -> NotificationTemplate {
        NotificationTemplate {
            notification_type: NotificationType::Welcome,
            channel: Channel::Email,
            title: title.to_string(),
            message: message.to_string(),
            html_content: html.map(str::to_string),
        }
    }

    fn vars(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn substitutes_known_tokens() {
        let tpl = template(
            "Welcome, {{userName}}!",
            "Hi {{userName}}, order {{orderId}} confirmed.",
            Some("<b>{{userName}}</b>"),
        );
        let rendered = render(
            &tpl,
            &vars(&[
                ("userName", json!("Ada")),
                ("orderId", json!(42)),
            ]),
        );
        assert_eq!(rendered.title, "Welcome, Ada!");
        assert_eq!(rendered.message, "Hi Ada, order 42 confirmed.");
        assert_eq!(rendered.html_content.as_deref(), Some("<b>Ada</b>"));
    }

    #[test]
    fn unknown_tokens_left_in_place() {
        let tpl = template("Hello {{missing}}", "{{alsoMissing}}", None);
        let rendered = render(&tpl, &vars(&[("userName", json!("Ada"))]));
        assert_eq!(rendered.title, "Hello {{missing}}");
        assert_eq!(rendered.message, "{{alsoMissing}}");
    }

    #[test]
    fn empty_variable_map_is_identity() {
        let tpl = template("T {{a}}", "M {{b}}", Some("H {{c}}"));
        let rendered = render(&tpl, &Metadata::new());
        assert_eq!(rendered.title, tpl.title);
        assert_eq!(rendered.message, tpl.message);
        assert_eq!(rendered.html_content, tpl.html_content);
    }

    #[test]
    fn render_is_idempotent() {
        let tpl = template("Hi {{name}}", "Bye {{name}}", None);
        let variables = vars(&[("name", json!("Ada"))]);
        let once = render(&tpl, &variables);

        let again = render(
            &NotificationTemplate {
                notification_type: tpl.notification_type.clone(),
                channel: tpl.channel,
                title: once.title.clone(),
                message: once.message.clone(),
                html_content: None,
            },
            &variables,
        );
        assert_eq!(again.title, once.title);
        assert_eq!(again.message, once.message);
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let cache = TemplateCache::with_capacity(2, 300);

        let t1 = NotificationTemplate {
            notification_type: NotificationType::Welcome,
            channel: Channel::Email,
            title: "t1".into(),
            message: "m1".into(),
            html_content: None,
        };
        let t2 = NotificationTemplate {
            notification_type: NotificationType::OrderShipped,
            channel: Channel::Push,
            title: "t2".into(),
            message: "m2".into(),
            html_content: None,
        };
        let t3 = NotificationTemplate {
            notification_type: NotificationType::PaymentFailed,
            channel: Channel::Email,
            title: "t3".into(),
            message: "m3".into(),
            html_content: None,
        };

        cache.insert(t1.clone()).await;
        cache.insert(t2.clone()).await;

        // Touch t1 so t2 becomes least recently used.
        assert!(cache.get(&NotificationType::Welcome, Channel::Email).await.is_some());

        cache.insert(t3).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&NotificationType::Welcome, Channel::Email).await.is_some());
        assert!(cache
            .get(&NotificationType::OrderShipped, Channel::Push)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_is_a_miss() {
        let cache = TemplateCache::with_capacity(10, 0);
        let tpl = template("t", "m", None);
        cache.insert(tpl).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get(&NotificationType::Welcome, Channel::Email).await.is_none());
    }
}
