use serde::{Deserialize, Serialize};

use crate::model::SendNotificationData;

/// Envelope shared by the four domain-event topics. Fields beyond
/// `eventType`/`userId` are populated per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

/// Payload of the bulk ingestion topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkMessage {
    pub batch_id: String,
    pub total_notifications: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub bulk_notifications: Vec<SendNotificationData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_event_tolerates_missing_fields() {
        let event: DomainEvent =
            serde_json::from_str(r#"{"eventType":"USER_UPDATED","userId":"u1"}"#).unwrap();
        assert_eq!(event.event_type, "USER_UPDATED");
        assert!(event.user_name.is_none());
    }

    #[test]
    fn bulk_message_round_trip() {
        let json = r#"{
            "batchId": "b-1",
            "totalNotifications": 2,
            "chunkIndex": 0,
            "totalChunks": 1,
            "bulkNotifications": [
                {"userId": "u1", "type": "WELCOME", "title": "t", "message": "m"},
                {"userId": "u2", "type": "ORDER_SHIPPED", "title": "t", "message": "m", "channel": "PUSH"}
            ]
        }"#;
        let bulk: BulkMessage = serde_json::from_str(json).unwrap();
        assert_eq!(bulk.bulk_notifications.len(), 2);
        assert_eq!(bulk.batch_id, "b-1");
    }
}
