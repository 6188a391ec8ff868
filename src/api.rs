// ============================================================================
// Request surface: gRPC service over the dispatcher
// ============================================================================

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PRODUCER_CHUNK;
use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::events::producer::{partition_key, EventProducer};
use crate::events::types::BulkMessage;
use crate::metrics::MetricsCollector;
use crate::model::{
    Channel, Metadata, NotificationType, Priority, SendNotificationData, MAX_BULK_ITEMS,
};

pub mod proto {
    tonic::include_proto!("courier.notification.v1");
}

pub use proto::notification_service_server::{NotificationService, NotificationServiceServer};

use proto::*;

/// Concurrent in-flight dispatches per bulk request.
const BULK_CONCURRENCY: usize = 100;

/// gRPC front over the dispatch pipeline.
pub struct NotificationApi {
    dispatcher: Arc<Dispatcher>,
    producer: EventProducer,
    bulk_topic: String,
    metrics: Arc<MetricsCollector>,
}

impl NotificationApi {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        producer: EventProducer,
        bulk_topic: impl Into<String>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            dispatcher,
            producer,
            bulk_topic: bulk_topic.into(),
            metrics,
        }
    }
}

/// Convert and validate a wire request into dispatch input.
fn parse_request(req: &SendNotificationRequest) -> Result<SendNotificationData, DispatchError> {
    if req.user_id.trim().is_empty() {
        return Err(DispatchError::invalid_argument("userId is required"));
    }
    if req.r#type.trim().is_empty() {
        return Err(DispatchError::invalid_argument("type is required"));
    }

    let channel = match &req.channel {
        Some(raw) => Some(Channel::from_str(raw)?),
        None => None,
    };
    let priority = match &req.priority {
        Some(raw) => Some(Priority::from_str(raw)?),
        None => None,
    };
    let scheduled_at = match &req.scheduled_at {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| {
                    DispatchError::invalid_argument(format!("scheduledAt is not RFC 3339: {}", e))
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let metadata = if req.metadata.is_empty() {
        None
    } else {
        Some(
            req.metadata
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect::<Metadata>(),
        )
    };

    let data = SendNotificationData {
        user_id: req.user_id.clone(),
        notification_type: NotificationType::parse(&req.r#type),
        title: req.title.clone(),
        message: req.message.clone(),
        channel,
        priority,
        metadata,
        scheduled_at,
    };
    data.validate()?;
    Ok(data)
}

#[tonic::async_trait]
impl NotificationService for NotificationApi {
    async fn send_notification(
        &self,
        request: Request<SendNotificationRequest>,
    ) -> Result<Response<SendNotificationResponse>, Status> {
        // Validation and store failures are surfaced in-band so the caller
        // can distinguish rejection from transport failure.
        let data = match parse_request(request.get_ref()) {
            Ok(data) => data,
            Err(e) => {
                return Ok(Response::new(SendNotificationResponse {
                    success: false,
                    notification_id: String::new(),
                    message: e.to_string(),
                }))
            }
        };

        match self.dispatcher.dispatch(&data).await {
            Ok(notification) => Ok(Response::new(SendNotificationResponse {
                success: true,
                notification_id: notification.id,
                message: "queued".to_string(),
            })),
            Err(e @ (DispatchError::StoreUnavailable(_) | DispatchError::InvalidArgument(_))) => {
                Ok(Response::new(SendNotificationResponse {
                    success: false,
                    notification_id: String::new(),
                    message: e.to_string(),
                }))
            }
            Err(e) => Err(Status::from(e)),
        }
    }

    async fn send_bulk_notifications(
        &self,
        request: Request<SendBulkNotificationsRequest>,
    ) -> Result<Response<SendBulkNotificationsResponse>, Status> {
        let item_count = request.get_ref().notifications.len();
        validate_bulk_size(item_count)?;
        let items: Vec<SendNotificationRequest> = request.get_ref().notifications.clone();

        let dispatcher = Arc::clone(&self.dispatcher);
        let results: Vec<Option<String>> = futures_util::stream::iter(items.clone())
            .map(|item| {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    let data = match parse_request(&item) {
                        Ok(data) => data,
                        Err(e) => {
                            debug!(error = %e, "bulk item rejected");
                            return None;
                        }
                    };
                    match dispatcher.dispatch(&data).await {
                        Ok(notification) => Some(notification.id),
                        Err(e) => {
                            warn!(user_id = %data.user_id, error = %e, "bulk item failed");
                            None
                        }
                    }
                }
            })
            .buffered(BULK_CONCURRENCY)
            .collect()
            .await;

        let notification_ids: Vec<String> = results.iter().flatten().cloned().collect();
        let success_count = notification_ids.len() as u32;
        let failure_count = (items.len() - notification_ids.len()) as u32;

        Ok(Response::new(SendBulkNotificationsResponse {
            success: failure_count == 0,
            notification_ids,
            success_count,
            failure_count,
        }))
    }

    async fn send_bulk_notifications_optimized(
        &self,
        request: Request<SendBulkNotificationsRequest>,
    ) -> Result<Response<SendBulkNotificationsResponse>, Status> {
        let items = &request.get_ref().notifications;
        validate_bulk_size(items.len())?;

        let mut parsed = Vec::with_capacity(items.len());
        for item in items {
            parsed.push(parse_request(item).map_err(Status::from)?);
        }

        let batch_id = Uuid::new_v4().to_string();
        let total = parsed.len();
        let chunks: Vec<Vec<SendNotificationData>> = parsed
            .chunks(PRODUCER_CHUNK)
            .map(|chunk| chunk.to_vec())
            .collect();
        let total_chunks = chunks.len() as u32;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let message = BulkMessage {
                batch_id: batch_id.clone(),
                total_notifications: total as u64,
                chunk_index: index as u32,
                total_chunks,
                bulk_notifications: chunk,
            };
            let payload = serde_json::to_vec(&message)
                .map_err(|e| Status::internal(format!("bulk encode: {}", e)))?;
            let key = partition_key(None, Some(batch_id.as_str()));

            self.producer
                .publish(&self.bulk_topic, key, &payload)
                .await
                .map_err(Status::from)?;
        }

        info!(batch_id = %batch_id, total = total, chunks = total_chunks, "bulk batch published");

        Ok(Response::new(SendBulkNotificationsResponse {
            success: true,
            notification_ids: Vec::new(),
            success_count: total as u32,
            failure_count: 0,
        }))
    }

    type SendNotificationStreamStream =
        Pin<Box<dyn futures_util::Stream<Item = Result<StreamSendResponse, Status>> + Send>>;

    async fn send_notification_stream(
        &self,
        request: Request<Streaming<StreamSendRequest>>,
    ) -> Result<Response<Self::SendNotificationStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<StreamSendResponse, Status>>(64);
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            while let Some(next) = inbound.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(error = %e, "stream closed by client");
                        break;
                    }
                };

                let dispatcher = Arc::clone(&dispatcher);
                let tx = tx.clone();
                // Per-message concurrency: each request dispatches on its
                // own task and replies with its correlation id.
                tokio::spawn(async move {
                    let request_id = message.request_id;
                    let response = match message.request {
                        None => StreamSendResponse {
                            request_id,
                            success: false,
                            notification_id: String::new(),
                            message: "missing request body".to_string(),
                        },
                        Some(req) => match parse_request(&req) {
                            Err(e) => StreamSendResponse {
                                request_id,
                                success: false,
                                notification_id: String::new(),
                                message: e.to_string(),
                            },
                            Ok(data) => match dispatcher.dispatch(&data).await {
                                Ok(notification) => StreamSendResponse {
                                    request_id,
                                    success: true,
                                    notification_id: notification.id,
                                    message: "queued".to_string(),
                                },
                                Err(e) => StreamSendResponse {
                                    request_id,
                                    success: false,
                                    notification_id: String::new(),
                                    message: e.to_string(),
                                },
                            },
                        },
                    };
                    let _ = tx.send(Ok(response)).await;
                });
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_notification_status(
        &self,
        request: Request<GetNotificationStatusRequest>,
    ) -> Result<Response<GetNotificationStatusResponse>, Status> {
        let id = &request.get_ref().notification_id;
        if id.trim().is_empty() {
            return Err(Status::invalid_argument("notificationId is required"));
        }

        match self.dispatcher.store().get(id).await.map_err(Status::from)? {
            Some(notification) => Ok(Response::new(GetNotificationStatusResponse {
                found: true,
                status: notification.status.as_str().to_string(),
                channel: notification.channel.as_str().to_string(),
                retry_count: notification.retry_count.max(0) as u32,
                error_message: notification.error_message,
            })),
            None => Ok(Response::new(GetNotificationStatusResponse {
                found: false,
                status: String::new(),
                channel: String::new(),
                retry_count: 0,
                error_message: None,
            })),
        }
    }

    async fn update_user_preferences(
        &self,
        request: Request<UpdateUserPreferencesRequest>,
    ) -> Result<Response<UpdateUserPreferencesResponse>, Status> {
        let req = request.get_ref();
        if req.user_id.trim().is_empty() {
            return Err(Status::invalid_argument("userId is required"));
        }
        let channel = Channel::from_str(&req.channel).map_err(Status::from)?;

        self.dispatcher
            .resolver()
            .upsert_preference(&req.user_id, channel, req.is_enabled)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(UpdateUserPreferencesResponse {
            success: true,
            message: format!("{} preference updated", channel),
        }))
    }

    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let _service = &request.get_ref().service;

        let counts = self
            .dispatcher
            .queues()
            .total_counts()
            .await
            .map_err(Status::from)?;

        let throughput = self
            .metrics
            .current()
            .map(|s| s.throughput_per_second)
            .unwrap_or(0.0);
        let status = if self.metrics.healthy() {
            "healthy"
        } else {
            "degraded"
        };

        Ok(Response::new(HealthCheckResponse {
            status: status.to_string(),
            timestamp: Utc::now().timestamp(),
            queue_depth: counts.waiting + counts.active,
            active_workers: self.metrics.active_workers().max(0) as u32,
            throughput_per_second: throughput,
        }))
    }
}

fn validate_bulk_size(len: usize) -> Result<(), Status> {
    if len == 0 {
        return Err(Status::invalid_argument("bulk payload carries no items"));
    }
    if len > MAX_BULK_ITEMS {
        return Err(Status::invalid_argument(format!(
            "bulk payload exceeds {} items",
            MAX_BULK_ITEMS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_request() -> SendNotificationRequest {
        SendNotificationRequest {
            user_id: "u1".to_string(),
            r#type: "WELCOME".to_string(),
            title: "Welcome!".to_string(),
            message: "hello".to_string(),
            channel: None,
            priority: None,
            metadata: Default::default(),
            scheduled_at: None,
        }
    }

    #[test]
    fn parse_accepts_minimal_request() {
        let data = parse_request(&wire_request()).unwrap();
        assert_eq!(data.notification_type, NotificationType::Welcome);
        assert!(data.channel.is_none());
    }

    #[test]
    fn parse_rejects_bad_channel() {
        let mut req = wire_request();
        req.channel = Some("CARRIER_PIGEON".to_string());
        assert!(parse_request(&req).is_err());
    }

    #[test]
    fn parse_rejects_bad_schedule() {
        let mut req = wire_request();
        req.scheduled_at = Some("tomorrow-ish".to_string());
        assert!(parse_request(&req).is_err());
    }

    #[test]
    fn parse_accepts_rfc3339_schedule() {
        let mut req = wire_request();
        let future = (chrono::Utc::now() + chrono::Duration::seconds(90)).to_rfc3339();
        req.scheduled_at = Some(future);
        let data = parse_request(&req).unwrap();
        assert!(data.scheduled_at.is_some());
    }

    #[test]
    fn parse_rejects_past_schedule() {
        let mut req = wire_request();
        let past = (chrono::Utc::now() - chrono::Duration::seconds(90)).to_rfc3339();
        req.scheduled_at = Some(past);
        assert!(parse_request(&req).is_err());
    }

    #[test]
    fn bulk_size_guards() {
        assert!(validate_bulk_size(0).is_err());
        assert!(validate_bulk_size(1).is_ok());
        assert!(validate_bulk_size(MAX_BULK_ITEMS).is_ok());
        assert!(validate_bulk_size(MAX_BULK_ITEMS + 1).is_err());
    }
}
