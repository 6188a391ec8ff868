// ============================================================================
// Event demultiplexing: topic + eventType -> dispatch actions
// ============================================================================

use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::CONSUMER_SUBBATCH;
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, DispatchResult};
use crate::model::{Channel, Metadata, NotificationType, Priority, SendNotificationData};

use super::types::{BulkMessage, DomainEvent};
use super::{TOPIC_AUTH_EVENTS, TOPIC_ORDER_EVENTS, TOPIC_PAYMENT_EVENTS, TOPIC_USER_EVENTS};

/// Translate one domain event into a dispatch request.
///
/// `Ok(None)` is a recognised no-op (e.g. USER_UPDATED) or an event kind
/// this service does not act on; unknown kinds are logged upstream and
/// skipped.
pub fn action_for_event(
    topic: &str,
    event: &DomainEvent,
) -> DispatchResult<Option<SendNotificationData>> {
    let user_id = event
        .user_id
        .clone()
        .ok_or_else(|| DispatchError::EventMalformed("event without userId".to_string()))?;

    let action = match (topic, event.event_type.as_str()) {
        (TOPIC_USER_EVENTS, "USER_REGISTERED") => {
            let name = event.user_name.clone().unwrap_or_else(|| "there".to_string());
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::Welcome,
                "Welcome!",
                format!("Welcome aboard, {}! We're glad you're here.", name),
            );
            data.channel = Some(Channel::Email);
            data.metadata = Some(Metadata::from([(
                "userName".to_string(),
                json!(name),
            )]));
            Some(data)
        }
        (TOPIC_USER_EVENTS, "USER_UPDATED") => None,
        (TOPIC_AUTH_EVENTS, "PASSWORD_RESET_REQUESTED") => {
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::PasswordReset,
                "Password reset requested",
                "We received a request to reset your password. Follow the link in this email to continue.",
            );
            data.channel = Some(Channel::Email);
            data.priority = Some(Priority::High);
            Some(data)
        }
        (TOPIC_AUTH_EVENTS, "EMAIL_VERIFICATION_REQUESTED") => {
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::EmailVerification,
                "Verify your email address",
                "Confirm your email address to finish setting up your account.",
            );
            data.channel = Some(Channel::Email);
            Some(data)
        }
        (TOPIC_ORDER_EVENTS, "ORDER_CREATED") => {
            let order_id = event.order_id.clone().unwrap_or_default();
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::OrderConfirmation,
                "Order confirmed",
                format!("Your order {} has been received.", order_id),
            );
            data.channel = Some(Channel::Email);
            data.metadata = Some(Metadata::from([(
                "orderId".to_string(),
                json!(order_id),
            )]));
            Some(data)
        }
        (TOPIC_ORDER_EVENTS, "ORDER_SHIPPED") => {
            let order_id = event.order_id.clone().unwrap_or_default();
            let tracking = event.tracking_number.clone().unwrap_or_default();
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::OrderShipped,
                "Order shipped",
                format!("Order {} is on its way. Tracking number: {}.", order_id, tracking),
            );
            data.channel = Some(Channel::Push);
            data.metadata = Some(Metadata::from([
                ("orderId".to_string(), json!(order_id)),
                ("trackingNumber".to_string(), json!(tracking)),
            ]));
            Some(data)
        }
        (TOPIC_ORDER_EVENTS, "ORDER_DELIVERED") => {
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::OrderDelivered,
                "Order delivered",
                "Your order has been delivered.",
            );
            data.channel = Some(Channel::Push);
            Some(data)
        }
        (TOPIC_PAYMENT_EVENTS, "PAYMENT_SUCCESS") => {
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::PaymentSuccess,
                "Payment received",
                "Your payment was processed successfully.",
            );
            data.channel = Some(Channel::Email);
            Some(data)
        }
        (TOPIC_PAYMENT_EVENTS, "PAYMENT_FAILED") => {
            let mut data = SendNotificationData::new(
                user_id,
                NotificationType::PaymentFailed,
                "Payment failed",
                "We couldn't process your payment. Please update your payment method.",
            );
            data.channel = Some(Channel::Email);
            data.priority = Some(Priority::High);
            Some(data)
        }
        _ => None,
    };

    Ok(action)
}

/// Outcome counters for one bulk chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Run a bulk message through the dispatcher in sub-batches of
/// `CONSUMER_SUBBATCH`, in parallel, with per-notification failure
/// isolation.
pub async fn handle_bulk(dispatcher: &Arc<Dispatcher>, bulk: BulkMessage) -> BulkOutcome {
    let started = Instant::now();
    let total = bulk.bulk_notifications.len();

    let sub_batches: Vec<Vec<SendNotificationData>> = bulk
        .bulk_notifications
        .chunks(CONSUMER_SUBBATCH)
        .map(|chunk| chunk.to_vec())
        .collect();

    info!(
        batch_id = %bulk.batch_id,
        chunk_index = bulk.chunk_index,
        total_chunks = bulk.total_chunks,
        notifications = total,
        sub_batches = sub_batches.len(),
        "processing bulk message"
    );

    let results = join_all(sub_batches.into_iter().map(|batch| {
        let dispatcher = Arc::clone(dispatcher);
        async move {
            let mut outcome = BulkOutcome::default();
            for data in batch {
                match dispatcher.dispatch(&data).await {
                    Ok(_) => outcome.succeeded += 1,
                    Err(e) => {
                        outcome.failed += 1;
                        warn!(user_id = %data.user_id, error = %e, "bulk item failed");
                    }
                }
            }
            outcome
        }
    }))
    .await;

    let outcome = results.iter().fold(BulkOutcome::default(), |acc, o| BulkOutcome {
        succeeded: acc.succeeded + o.succeeded,
        failed: acc.failed + o.failed,
    });

    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    info!(
        batch_id = %bulk.batch_id,
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        throughput_per_second = format!("{:.1}", total as f64 / elapsed),
        "bulk message processed"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, user_id: Option<&str>) -> DomainEvent {
        DomainEvent {
            event_type: event_type.to_string(),
            user_id: user_id.map(str::to_string),
            user_name: None,
            order_id: None,
            tracking_number: None,
        }
    }

    #[test]
    fn user_registered_becomes_welcome_email() {
        let mut ev = event("USER_REGISTERED", Some("u1"));
        ev.user_name = Some("Ada".to_string());

        let data = action_for_event(TOPIC_USER_EVENTS, &ev).unwrap().unwrap();
        assert_eq!(data.notification_type, NotificationType::Welcome);
        assert_eq!(data.channel, Some(Channel::Email));
        assert_eq!(data.title, "Welcome!");
        assert!(data.message.contains("Ada"));
    }

    #[test]
    fn user_updated_is_a_noop() {
        let ev = event("USER_UPDATED", Some("u1"));
        assert!(action_for_event(TOPIC_USER_EVENTS, &ev).unwrap().is_none());
    }

    #[test]
    fn password_reset_is_high_priority() {
        let ev = event("PASSWORD_RESET_REQUESTED", Some("u1"));
        let data = action_for_event(TOPIC_AUTH_EVENTS, &ev).unwrap().unwrap();
        assert_eq!(data.notification_type, NotificationType::PasswordReset);
        assert_eq!(data.priority, Some(Priority::High));
    }

    #[test]
    fn order_shipped_carries_tracking_metadata() {
        let mut ev = event("ORDER_SHIPPED", Some("u2"));
        ev.order_id = Some("o-9".to_string());
        ev.tracking_number = Some("TRK123".to_string());

        let data = action_for_event(TOPIC_ORDER_EVENTS, &ev).unwrap().unwrap();
        assert_eq!(data.channel, Some(Channel::Push));
        let metadata = data.metadata.unwrap();
        assert_eq!(metadata["orderId"], json!("o-9"));
        assert_eq!(metadata["trackingNumber"], json!("TRK123"));
    }

    #[test]
    fn event_without_user_id_is_malformed() {
        let ev = event("PAYMENT_SUCCESS", None);
        assert!(action_for_event(TOPIC_PAYMENT_EVENTS, &ev).is_err());
    }

    #[test]
    fn unknown_event_type_is_skipped() {
        let ev = event("SOMETHING_ELSE", Some("u1"));
        assert!(action_for_event(TOPIC_USER_EVENTS, &ev).unwrap().is_none());
    }
}
