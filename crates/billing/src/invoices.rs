//! Invoice lifecycle
//!
//! Creates the invoice for one billing period, cancels still-pending invoices
//! from earlier periods that the new one supersedes, and moves the profile's
//! `next_due_date` to the following period. All three land in one
//! [`UnitOfWork`].
//!
//! The manager does not check whether an invoice for the period already
//! exists. Callers query [`InvoiceService::find_period_invoice`] first; each
//! reconciliation step does so with its own query shape.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::models::{BillingProfile, Invoice, InvoiceStatus};
use crate::period::{period_for, sub_days, Period};
use crate::store::{BillingStore, BillingWrite, UnitOfWork};

/// An invoice ready to be written, with everything that changes alongside it
#[derive(Debug, Clone)]
pub struct PreparedInvoice {
    pub invoice: Invoice,
    /// Pending invoices the new one replaces
    pub superseded: Vec<Invoice>,
    /// Due date of the period after the invoiced one, or the profile's current
    /// cursor when that is already further ahead
    pub next_due_date: NaiveDate,
}

impl PreparedInvoice {
    /// Writes in commit order: cancellations, the new invoice, the profile cursor
    pub fn into_writes(self) -> Vec<BillingWrite> {
        let number = self.invoice.invoice_number.clone();
        let client_id = self.invoice.client_id;
        let period = self.invoice.period();

        let mut writes: Vec<BillingWrite> = self
            .superseded
            .into_iter()
            .map(|old| BillingWrite::CancelInvoice {
                invoice_id: old.id,
                superseded_by: number.clone(),
                reason: format!("Superseded by {number} for period {period}"),
            })
            .collect();
        writes.push(BillingWrite::InsertInvoice(self.invoice));
        writes.push(BillingWrite::SetNextDueDate {
            client_id,
            next_due_date: self.next_due_date,
        });
        writes
    }
}

/// Period whose due date is `due_date` under the profile's grace days
pub fn period_due_on(profile: &BillingProfile, due_date: NaiveDate) -> BillingResult<Period> {
    let start = sub_days(due_date, profile.grace_days)?;
    period_for(profile.billing_day, start)
}

/// Invoice lifecycle manager
#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn BillingStore>,
    number_prefix: String,
    tax_rate: Decimal,
}

impl InvoiceService {
    pub fn new(store: Arc<dyn BillingStore>, config: &BillingConfig) -> Self {
        Self {
            store,
            number_prefix: config.invoice_number_prefix.clone(),
            tax_rate: config.tax_rate,
        }
    }

    /// The non-cancelled invoice covering exactly `period`
    pub async fn find_period_invoice(
        &self,
        client_id: Uuid,
        period: &Period,
    ) -> BillingResult<Option<Invoice>> {
        self.store.find_period_invoice(client_id, period).await
    }

    /// Amount with the flat tax rate applied, rounded to cents
    pub fn total_with_tax(&self, amount: Decimal) -> Decimal {
        (amount * (Decimal::ONE + self.tax_rate)).round_dp(2)
    }

    /// `{prefix}-{YYYYMM}-{client}-{suffix}`, unique across clients and retries
    pub fn generate_invoice_number(&self, client_id: Uuid, period: &Period) -> String {
        let client = client_id.simple().to_string();
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            self.number_prefix,
            period.start.format("%Y%m"),
            &client[..8],
            suffix[..8].to_uppercase()
        )
    }

    /// Build the invoice for `period` without writing anything.
    ///
    /// Returns `None` when the client has no billable subscription.
    pub async fn prepare_invoice(
        &self,
        profile: &BillingProfile,
        period: &Period,
        today: NaiveDate,
    ) -> BillingResult<Option<PreparedInvoice>> {
        let client_id = profile.client_id;

        let Some(subscription) = self.store.active_subscription(client_id).await? else {
            tracing::debug!(
                client_id = %client_id,
                period = %period,
                "No active subscription, not invoicing"
            );
            return Ok(None);
        };

        // Backfilling an older period never moves the cursor backwards
        let next_due_date = period
            .following(profile.billing_day)?
            .due_date(profile.grace_days)?
            .max(profile.next_due_date);

        let invoice_number = self.generate_invoice_number(client_id, period);

        let superseded: Vec<Invoice> = self
            .store
            .pending_invoices_ending_before(client_id, period.end)
            .await?
            .into_iter()
            .filter(|old| old.due_date >= today)
            .collect();

        let now = OffsetDateTime::now_utc();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            client_id,
            subscription_id: subscription.id,
            invoice_number,
            billing_period_start: period.start,
            billing_period_end: period.end,
            amount: profile.monthly_fee,
            total_amount: self.total_with_tax(profile.monthly_fee),
            due_date: period.due_date(profile.grace_days)?,
            status: InvoiceStatus::Pending,
            superseded_by: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        Ok(Some(PreparedInvoice {
            invoice,
            superseded,
            next_due_date,
        }))
    }

    /// Create and commit the invoice for `period`
    pub async fn create_invoice_for_profile(
        &self,
        profile: &BillingProfile,
        period: &Period,
        today: NaiveDate,
    ) -> BillingResult<Option<Invoice>> {
        let Some(prepared) = self.prepare_invoice(profile, period, today).await? else {
            return Ok(None);
        };

        let invoice = prepared.invoice.clone();
        let superseded = prepared.superseded.len();

        let mut unit = UnitOfWork::new(profile.client_id);
        for write in prepared.into_writes() {
            unit.push(write);
        }
        self.store.commit(unit).await?;

        tracing::info!(
            client_id = %profile.client_id,
            invoice_number = %invoice.invoice_number,
            period = %period,
            due_date = %invoice.due_date,
            superseded,
            "Invoice created"
        );

        Ok(Some(invoice))
    }
}
