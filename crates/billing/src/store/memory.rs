//! In-memory store for tests and database-less development runs

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BillingStore, BillingWrite, ProfileQuery, UnitOfWork};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingAdjustment, BillingProfile, Client, Invoice, InvoiceStatus, NotificationEntry,
    Payment, Subscription,
};
use crate::period::Period;

#[derive(Debug, Clone, Default)]
struct State {
    clients: HashMap<Uuid, Client>,
    profiles: HashMap<Uuid, BillingProfile>,
    subscriptions: HashMap<Uuid, Subscription>,
    invoices: HashMap<Uuid, Invoice>,
    payments: HashMap<Uuid, Payment>,
    adjustments: Vec<BillingAdjustment>,
    notifications: Vec<NotificationEntry>,
}

impl State {
    fn profile_mut(&mut self, client_id: Uuid) -> BillingResult<&mut BillingProfile> {
        self.profiles
            .get_mut(&client_id)
            .ok_or(BillingError::NoBillingProfile(client_id))
    }

    fn invoice_mut(&mut self, invoice_id: Uuid) -> BillingResult<&mut Invoice> {
        self.invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| BillingError::Store(format!("invoice {invoice_id} does not exist")))
    }

    fn apply(&mut self, write: BillingWrite) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        match write {
            BillingWrite::InsertInvoice(invoice) => {
                let clash = self.invoices.values().any(|existing| {
                    existing.invoice_number == invoice.invoice_number
                        || (existing.client_id == invoice.client_id
                            && existing.status != InvoiceStatus::Cancelled
                            && existing.covers(&invoice.period()))
                });
                if clash {
                    return Err(BillingError::Store(format!(
                        "duplicate invoice {} for client {} period {}",
                        invoice.invoice_number,
                        invoice.client_id,
                        invoice.period()
                    )));
                }
                self.invoices.insert(invoice.id, invoice);
            }
            BillingWrite::CancelInvoice {
                invoice_id,
                superseded_by,
                reason,
            } => {
                let invoice = self.invoice_mut(invoice_id)?;
                invoice.status = InvoiceStatus::Cancelled;
                invoice.superseded_by = Some(superseded_by);
                invoice.cancellation_reason = Some(reason);
                invoice.updated_at = now;
            }
            BillingWrite::SetInvoiceStatus { invoice_id, status } => {
                let invoice = self.invoice_mut(invoice_id)?;
                invoice.status = status;
                invoice.updated_at = now;
            }
            BillingWrite::SetNextDueDate {
                client_id,
                next_due_date,
            } => {
                let profile = self.profile_mut(client_id)?;
                profile.next_due_date = next_due_date;
                profile.updated_at = now;
            }
            BillingWrite::SetClientStatus { client_id, status } => {
                let profile = self.profile_mut(client_id)?;
                profile.client_status = status;
                profile.updated_at = now;
            }
            BillingWrite::SetServiceEndDate {
                client_id,
                service_end_date,
            } => {
                let profile = self.profile_mut(client_id)?;
                profile.service_end_date = Some(service_end_date);
                profile.updated_at = now;
            }
            BillingWrite::InsertPayment(payment) => {
                if self.payments.contains_key(&payment.id) {
                    return Err(BillingError::Store(format!(
                        "payment {} already exists",
                        payment.id
                    )));
                }
                self.payments.insert(payment.id, payment);
            }
            BillingWrite::AssignPayment {
                payment_id,
                invoice_id,
            } => {
                if !self.invoices.contains_key(&invoice_id) {
                    return Err(BillingError::Store(format!(
                        "invoice {invoice_id} does not exist"
                    )));
                }
                let payment = self.payments.get_mut(&payment_id).ok_or_else(|| {
                    BillingError::Store(format!("payment {payment_id} does not exist"))
                })?;
                payment.invoice_id = Some(invoice_id);
            }
            BillingWrite::InsertAdjustment(adjustment) => self.adjustments.push(adjustment),
            BillingWrite::EnqueueNotification(entry) => {
                if !self
                    .notifications
                    .iter()
                    .any(|n| n.dedupe_key == entry.dedupe_key)
                {
                    self.notifications.push(entry);
                }
            }
        }
        Ok(())
    }
}

/// [`BillingStore`] kept in process memory.
///
/// Commits apply to a copy of the state which replaces the original only when
/// every write succeeded.
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    state: RwLock<State>,
    failing_clients: RwLock<HashSet<Uuid>>,
    commits: AtomicUsize,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_client(&self, client: Client) {
        self.state.write().await.clients.insert(client.id, client);
    }

    pub async fn insert_profile(&self, profile: BillingProfile) {
        self.state
            .write()
            .await
            .profiles
            .insert(profile.client_id, profile);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.state.write().await.invoices.insert(invoice.id, invoice);
    }

    pub async fn insert_payment(&self, payment: Payment) {
        self.state.write().await.payments.insert(payment.id, payment);
    }

    /// Make every subsequent commit for `client_id` fail with a store error
    pub async fn fail_commits_for(&self, client_id: Uuid) {
        self.failing_clients.write().await.insert(client_id);
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_client(&self, client_id: Uuid) -> BillingResult<Option<Client>> {
        Ok(self.state.read().await.clients.get(&client_id).cloned())
    }

    async fn get_profile(&self, client_id: Uuid) -> BillingResult<Option<BillingProfile>> {
        Ok(self.state.read().await.profiles.get(&client_id).cloned())
    }

    async fn list_profiles(&self, query: &ProfileQuery) -> BillingResult<Vec<BillingProfile>> {
        let state = self.state.read().await;
        let mut profiles: Vec<BillingProfile> = state
            .profiles
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        profiles.sort_by_key(|p| p.client_id);
        Ok(profiles)
    }

    async fn active_subscription(&self, client_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.read().await;
        let mut subs: Vec<&Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.client_id == client_id && s.is_billable())
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs.first().map(|s| (*s).clone()))
    }

    async fn find_period_invoice(
        &self,
        client_id: Uuid,
        period: &Period,
    ) -> BillingResult<Option<Invoice>> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.client_id == client_id
                    && i.status != InvoiceStatus::Cancelled
                    && i.covers(period)
            })
            .cloned())
    }

    async fn pending_invoices_ending_before(
        &self,
        client_id: Uuid,
        period_end: NaiveDate,
    ) -> BillingResult<Vec<Invoice>> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| {
                i.client_id == client_id
                    && i.status == InvoiceStatus::Pending
                    && i.billing_period_end < period_end
            })
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.billing_period_start);
        Ok(invoices)
    }

    async fn unpaid_invoices(&self, client_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.client_id == client_id && i.status.is_unpaid())
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.due_date, i.billing_period_start));
        Ok(invoices)
    }

    async fn list_invoices(&self, client_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.client_id == client_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.billing_period_start, i.created_at));
        Ok(invoices)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.state.read().await.invoices.get(&invoice_id).cloned())
    }

    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&payment_id).cloned())
    }

    async fn list_adjustments(&self, client_id: Uuid) -> BillingResult<Vec<BillingAdjustment>> {
        Ok(self
            .state
            .read()
            .await
            .adjustments
            .iter()
            .filter(|a| a.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn notification_exists(&self, dedupe_key: &str) -> BillingResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .notifications
            .iter()
            .any(|n| n.dedupe_key == dedupe_key))
    }

    async fn list_notifications(&self, client_id: Uuid) -> BillingResult<Vec<NotificationEntry>> {
        Ok(self
            .state
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, unit: UnitOfWork) -> BillingResult<()> {
        if self.failing_clients.read().await.contains(&unit.client_id) {
            return Err(BillingError::Store(format!(
                "simulated write failure for client {}",
                unit.client_id
            )));
        }

        let mut state = self.state.write().await;
        let mut draft = state.clone();
        for write in unit.writes {
            draft.apply(write)?;
        }
        *state = draft;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
