//! Billing data model
//!
//! Entities shared between the engine and the store. Statuses are persisted
//! as lowercase snake_case text.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::period::Period;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// =============================================================================
// Client
// =============================================================================

/// Subscriber record, owned outside the billing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

// =============================================================================
// Billing profile
// =============================================================================

/// Network/billing status of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Suspended,
    GracePeriod,
    Cancelled,
    Paused,
}

text_enum!(ClientStatus {
    Active => "active",
    Suspended => "suspended",
    GracePeriod => "grace_period",
    Cancelled => "cancelled",
    Paused => "paused",
});

impl ClientStatus {
    /// Statuses that keep accruing invoices. Cancelled and paused clients are never billed.
    pub const BILLABLE: [ClientStatus; 3] = [
        ClientStatus::Active,
        ClientStatus::GracePeriod,
        ClientStatus::Suspended,
    ];

    pub fn is_billable(&self) -> bool {
        Self::BILLABLE.contains(self)
    }
}

/// Per-client billing configuration and cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingProfile {
    pub client_id: Uuid,
    /// Anchor day of month (1-28 for new profiles, clamped per month when larger)
    pub billing_day: u32,
    pub monthly_fee: Decimal,
    pub grace_days: u32,
    /// Due date of the next period to be invoiced
    pub next_due_date: NaiveDate,
    pub client_status: ClientStatus,
    /// Last day of service granted by a late-payment reactivation
    pub service_end_date: Option<NaiveDate>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
}

text_enum!(SubscriptionStatus {
    Active => "active",
    Inactive => "inactive",
    Cancelled => "cancelled",
});

/// A client's contracted service package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub client_id: Uuid,
    pub service_package: String,
    pub package_active: bool,
    pub status: SubscriptionStatus,
}

impl Subscription {
    pub fn is_billable(&self) -> bool {
        self.status == SubscriptionStatus::Active && self.package_active
    }
}

// =============================================================================
// Invoice
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    PartialPaid,
    Overdue,
    LostRevenue,
    Cancelled,
}

text_enum!(InvoiceStatus {
    Pending => "pending",
    Paid => "paid",
    PartialPaid => "partial_paid",
    Overdue => "overdue",
    LostRevenue => "lost_revenue",
    Cancelled => "cancelled",
});

impl InvoiceStatus {
    /// Still waiting for money
    pub fn is_unpaid(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Pending | InvoiceStatus::PartialPaid | InvoiceStatus::Overdue
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub client_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_number: String,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub amount: Decimal,
    pub total_amount: Decimal,
    pub due_date: NaiveDate,
    pub status: InvoiceStatus,
    /// Number of the invoice that replaced this one when cancelled
    pub superseded_by: Option<String>,
    pub cancellation_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Invoice {
    pub fn period(&self) -> Period {
        Period {
            start: self.billing_period_start,
            end: self.billing_period_end,
        }
    }

    pub fn covers(&self, period: &Period) -> bool {
        self.billing_period_start == period.start && self.billing_period_end == period.end
    }

    /// Overdue is derived from the due date rather than stored
    pub fn is_overdue_on(&self, today: NaiveDate) -> bool {
        self.status.is_unpaid() && self.due_date < today
    }
}

// =============================================================================
// Payment
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

text_enum!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub client_id: Uuid,
    /// Unset until the payment is applied to an invoice
    pub invoice_id: Option<Uuid>,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Notification queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    ServiceSuspended,
    PaymentReminder,
    ServiceReactivated,
}

text_enum!(NotificationType {
    ServiceSuspended => "service_suspended",
    PaymentReminder => "payment_reminder",
    ServiceReactivated => "service_reactivated",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
}

text_enum!(NotificationPriority {
    Low => "low",
    Normal => "normal",
    High => "high",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Queued,
    Sent,
    Failed,
}

text_enum!(NotificationStatus {
    Queued => "queued",
    Sent => "sent",
    Failed => "failed",
});

/// A message waiting for the external delivery worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub id: Uuid,
    pub client_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub status: NotificationStatus,
    /// Entries with the same key are enqueued once
    pub dedupe_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Billing adjustment
// =============================================================================

/// Manual follow-up left by a prorated reactivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAdjustment {
    pub id: Uuid,
    pub client_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_id: Uuid,
    pub proportional_amount: Decimal,
    pub days_remaining: i64,
    pub reason: String,
    pub resolved: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
