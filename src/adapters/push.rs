use a2::{
    Client, ClientConfig, DefaultNotificationBuilder, Endpoint, NotificationBuilder,
    NotificationOptions, Priority as ApnsPriority,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::fs::File;
use std::io::BufReader;
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::model::Channel;
use crate::queue::Job;
use crate::resolver::Recipient;
use crate::store::NotificationStore;
use crate::template::RenderedContent;

use super::ChannelAdapter;

/// Queue weight at or above which pushes are sent with high APNs priority.
const HIGH_PRIORITY_WEIGHT: i64 = 10;

/// APNs delivery with per-token parallel fan-out.
///
/// A job succeeds iff every token send succeeds. Tokens the gateway reports
/// as invalid are deactivated in the store before the failure is reported,
/// so retries only fan out to surviving tokens.
pub struct PushAdapter {
    client: Option<Client>,
    topic: String,
    store: NotificationStore,
}

impl PushAdapter {
    pub fn new(config: &PushConfig, store: NotificationStore) -> DispatchResult<Self> {
        if !config.enabled {
            info!("push delivery disabled; push jobs will be acknowledged without sending");
            return Ok(Self {
                client: None,
                topic: config.topic.clone(),
                store,
            });
        }

        let key_file = File::open(&config.key_path).map_err(|e| {
            DispatchError::internal(format!(
                "failed to open push key file {}: {}",
                config.key_path, e
            ))
        })?;
        let endpoint = if config.production {
            Endpoint::Production
        } else {
            Endpoint::Sandbox
        };
        let client = Client::token(
            BufReader::new(key_file),
            &config.key_id,
            &config.team_id,
            ClientConfig::new(endpoint),
        )
        .map_err(|e| DispatchError::internal(format!("push client init: {}", e)))?;

        info!(
            key_id = %config.key_id,
            team_id = %config.team_id,
            production = config.production,
            "push client initialized"
        );

        Ok(Self {
            client: Some(client),
            topic: config.topic.clone(),
            store,
        })
    }

    async fn send_to_token(
        &self,
        client: &Client,
        job: &Job,
        content: &RenderedContent,
        token: &str,
    ) -> Result<(), (String, DispatchError)> {
        let options = NotificationOptions {
            apns_topic: Some(&self.topic),
            apns_priority: if job.priority >= HIGH_PRIORITY_WEIGHT {
                Some(ApnsPriority::High)
            } else {
                Some(ApnsPriority::Normal)
            },
            ..Default::default()
        };

        let payload = DefaultNotificationBuilder::new()
            .set_title(&content.title)
            .set_body(&content.message)
            .build(token, options);

        match client.send(payload).await {
            Ok(response) => {
                debug!(
                    notification_id = %job.notification_id,
                    token_prefix = &token[..8.min(token.len())],
                    code = response.code,
                    "push accepted"
                );
                Ok(())
            }
            Err(a2::Error::ResponseError(response)) if response.code == 400 || response.code == 410 => {
                // Gateway says the token is gone; stop targeting it.
                Err((
                    token.to_string(),
                    DispatchError::AdapterPermanent(format!(
                        "invalid device token (code {})",
                        response.code
                    )),
                ))
            }
            Err(e) => Err((
                token.to_string(),
                DispatchError::AdapterTransient(format!("push send failed: {}", e)),
            )),
        }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn deliver(
        &self,
        job: &Job,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<()> {
        let tokens = match recipient {
            Recipient::Tokens(tokens) => tokens,
            _ => {
                return Err(DispatchError::internal(
                    "push adapter invoked with non-token recipient",
                ))
            }
        };

        let client = match &self.client {
            Some(client) => client,
            None => {
                debug!(notification_id = %job.notification_id, "push disabled, skipping send");
                return Ok(());
            }
        };

        let sends = tokens
            .iter()
            .map(|t| self.send_to_token(client, job, content, &t.token));
        let results = join_all(sends).await;

        let mut invalid = 0usize;
        let mut first_error: Option<DispatchError> = None;
        for result in results {
            if let Err((token, err)) = result {
                if matches!(err, DispatchError::AdapterPermanent(_)) {
                    invalid += 1;
                    if let Err(e) = self
                        .store
                        .deactivate_device_token(&job.user_id, &token)
                        .await
                    {
                        warn!(user_id = %job.user_id, error = %e, "token deactivation failed");
                    }
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            None => {
                info!(
                    notification_id = %job.notification_id,
                    tokens = tokens.len(),
                    "push delivered to all devices"
                );
                Ok(())
            }
            Some(err) => {
                warn!(
                    notification_id = %job.notification_id,
                    tokens = tokens.len(),
                    deactivated = invalid,
                    error = %err,
                    "push fan-out failed"
                );
                Err(err)
            }
        }
    }
}
