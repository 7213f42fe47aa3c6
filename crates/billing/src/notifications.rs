//! Notification sink
//!
//! The engine only enqueues. Delivery (email, SMS, chat) belongs to an external
//! worker reading the queue.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{
    NotificationEntry, NotificationPriority, NotificationStatus, NotificationType,
};
use crate::store::{BillingStore, BillingWrite, UnitOfWork};

/// A notification to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub client_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    /// Requests sharing a key are queued once
    pub dedupe_key: String,
}

impl NotificationRequest {
    pub fn service_suspended(client_id: Uuid, reason: &str, day: chrono::NaiveDate) -> Self {
        Self {
            client_id,
            notification_type: NotificationType::ServiceSuspended,
            title: "Service suspended".to_string(),
            message: format!("Your internet service has been suspended: {reason}"),
            priority: NotificationPriority::High,
            dedupe_key: format!("service_suspended:{client_id}:{day}"),
        }
    }

    pub fn payment_reminder(
        client_id: Uuid,
        due_date: chrono::NaiveDate,
        day: chrono::NaiveDate,
    ) -> Self {
        Self {
            client_id,
            notification_type: NotificationType::PaymentReminder,
            title: "Payment reminder".to_string(),
            message: format!("Your payment is due on {due_date}"),
            priority: NotificationPriority::Normal,
            dedupe_key: format!("payment_reminder:{client_id}:{due_date}:{day}"),
        }
    }

    pub fn service_reactivated(
        client_id: Uuid,
        payment_id: Uuid,
        service_end_date: chrono::NaiveDate,
    ) -> Self {
        Self {
            client_id,
            notification_type: NotificationType::ServiceReactivated,
            title: "Service reactivated".to_string(),
            message: format!(
                "Thank you for your payment. Your service is active through {service_end_date}"
            ),
            priority: NotificationPriority::Normal,
            dedupe_key: format!("service_reactivated:{client_id}:{payment_id}"),
        }
    }

    fn into_entry(self) -> NotificationEntry {
        NotificationEntry {
            id: Uuid::new_v4(),
            client_id: self.client_id,
            notification_type: self.notification_type,
            title: self.title,
            message: self.message,
            priority: self.priority,
            status: NotificationStatus::Queued,
            dedupe_key: self.dedupe_key,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Queue a notification. Returns `true` when a new entry was queued.
    ///
    /// Never fails: delivery problems are logged and swallowed.
    async fn enqueue(&self, request: NotificationRequest) -> bool;
}

/// Writes notifications to the store's queue table
pub struct QueueNotificationSink {
    store: Arc<dyn BillingStore>,
}

impl QueueNotificationSink {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for QueueNotificationSink {
    async fn enqueue(&self, request: NotificationRequest) -> bool {
        let client_id = request.client_id;
        let kind = request.notification_type;

        match self.store.notification_exists(&request.dedupe_key).await {
            Ok(true) => {
                tracing::debug!(
                    client_id = %client_id,
                    dedupe_key = %request.dedupe_key,
                    "Notification already queued"
                );
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "Notification lookup failed");
                return false;
            }
        }

        let mut unit = UnitOfWork::new(client_id);
        unit.push(BillingWrite::EnqueueNotification(request.into_entry()));

        match self.store.commit(unit).await {
            Ok(()) => {
                tracing::debug!(client_id = %client_id, notification_type = %kind, "Notification queued");
                true
            }
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    notification_type = %kind,
                    error = %e,
                    "Failed to queue notification"
                );
                false
            }
        }
    }
}
