use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult};
use crate::events::producer::EventProducer;
use crate::model::Channel;
use crate::queue::Job;
use crate::resolver::Recipient;
use crate::template::RenderedContent;

use super::ChannelAdapter;

/// Outbound SMS payload consumed by the carrier bridge.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SmsMessage<'a> {
    notification_id: &'a str,
    user_id: &'a str,
    phone: &'a str,
    body: &'a str,
}

/// SMS delivery: publish to the carrier topic keyed by user id.
pub struct SmsAdapter {
    producer: EventProducer,
    topic: String,
}

impl SmsAdapter {
    pub fn new(producer: EventProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn deliver(
        &self,
        job: &Job,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<()> {
        let phone = match recipient {
            Recipient::Phone(phone) => phone,
            _ => {
                return Err(DispatchError::internal(
                    "sms adapter invoked with non-phone recipient",
                ))
            }
        };

        let message = SmsMessage {
            notification_id: &job.notification_id,
            user_id: &job.user_id,
            phone,
            body: &content.message,
        };
        let payload = serde_json::to_vec(&message)
            .map_err(|e| DispatchError::internal(format!("sms payload encode: {}", e)))?;

        debug!(notification_id = %job.notification_id, "publishing sms");

        // A broker rejection here is transient from the pipeline's view: the
        // queue retry policy reschedules the job.
        self.producer
            .publish(&self.topic, &job.user_id, &payload)
            .await
            .map_err(|e| DispatchError::AdapterTransient(e.to_string()))?;

        info!(
            notification_id = %job.notification_id,
            topic = %self.topic,
            "sms published to carrier topic"
        );
        Ok(())
    }
}
