//! Persistence port
//!
//! The engine reads through [`BillingStore`] query methods and writes only by
//! committing a [`UnitOfWork`]: an ordered batch of [`BillingWrite`]s for one
//! client that the adapter applies all-or-nothing.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::{create_pool, PgBillingStore};

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    BillingAdjustment, BillingProfile, Client, ClientStatus, Invoice, InvoiceStatus,
    NotificationEntry, Payment, Subscription,
};
use crate::period::Period;

/// A single row mutation
#[derive(Debug, Clone, PartialEq)]
pub enum BillingWrite {
    InsertInvoice(Invoice),
    /// Cancel an invoice, keeping it with a reference to its replacement
    CancelInvoice {
        invoice_id: Uuid,
        superseded_by: String,
        reason: String,
    },
    SetInvoiceStatus {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },
    SetNextDueDate {
        client_id: Uuid,
        next_due_date: NaiveDate,
    },
    SetClientStatus {
        client_id: Uuid,
        status: ClientStatus,
    },
    SetServiceEndDate {
        client_id: Uuid,
        service_end_date: NaiveDate,
    },
    InsertPayment(Payment),
    AssignPayment {
        payment_id: Uuid,
        invoice_id: Uuid,
    },
    InsertAdjustment(BillingAdjustment),
    EnqueueNotification(NotificationEntry),
}

/// Writes for one client that must land together
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    pub client_id: Uuid,
    pub writes: Vec<BillingWrite>,
}

impl UnitOfWork {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            writes: Vec::new(),
        }
    }

    pub fn push(&mut self, write: BillingWrite) {
        self.writes.push(write);
    }

    pub fn extend(&mut self, other: UnitOfWork) {
        self.writes.extend(other.writes);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Filter for [`BillingStore::list_profiles`]
#[derive(Debug, Clone, Default)]
pub struct ProfileQuery {
    /// Empty means any status
    pub statuses: Vec<ClientStatus>,
    /// Only profiles with `next_due_date > due_after`
    pub due_after: Option<NaiveDate>,
    /// Only profiles with `next_due_date <= due_on_or_before`
    pub due_on_or_before: Option<NaiveDate>,
}

impl ProfileQuery {
    pub fn with_statuses(statuses: &[ClientStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn due_on_or_before(mut self, date: NaiveDate) -> Self {
        self.due_on_or_before = Some(date);
        self
    }

    pub fn due_after(mut self, date: NaiveDate) -> Self {
        self.due_after = Some(date);
        self
    }

    pub fn matches(&self, profile: &BillingProfile) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&profile.client_status))
            && self.due_after.map_or(true, |d| profile.next_due_date > d)
            && self
                .due_on_or_before
                .map_or(true, |d| profile.next_due_date <= d)
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_client(&self, client_id: Uuid) -> BillingResult<Option<Client>>;

    async fn get_profile(&self, client_id: Uuid) -> BillingResult<Option<BillingProfile>>;

    /// Profiles matching the query, ordered by client id
    async fn list_profiles(&self, query: &ProfileQuery) -> BillingResult<Vec<BillingProfile>>;

    async fn active_subscription(&self, client_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The non-cancelled invoice for exactly this period, if any
    async fn find_period_invoice(
        &self,
        client_id: Uuid,
        period: &Period,
    ) -> BillingResult<Option<Invoice>>;

    /// Pending invoices whose period ends strictly before `period_end`
    async fn pending_invoices_ending_before(
        &self,
        client_id: Uuid,
        period_end: NaiveDate,
    ) -> BillingResult<Vec<Invoice>>;

    /// Pending, partially paid or overdue invoices, oldest due date first
    async fn unpaid_invoices(&self, client_id: Uuid) -> BillingResult<Vec<Invoice>>;

    /// Every invoice of a client, cancelled included, by period start
    async fn list_invoices(&self, client_id: Uuid) -> BillingResult<Vec<Invoice>>;

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>>;

    async fn list_adjustments(&self, client_id: Uuid) -> BillingResult<Vec<BillingAdjustment>>;

    async fn notification_exists(&self, dedupe_key: &str) -> BillingResult<bool>;

    /// Queued notifications of a client, oldest first
    async fn list_notifications(&self, client_id: Uuid) -> BillingResult<Vec<NotificationEntry>>;

    /// Apply every write or none of them
    async fn commit(&self, unit: UnitOfWork) -> BillingResult<()>;
}
