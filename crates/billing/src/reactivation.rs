//! Late-payment reactivation
//!
//! A payment from a suspended or overdue client settles the period containing
//! the payment date in one of two ways, chosen by the days left in that period:
//!
//! - **Gift** (`days_remaining <= auto_gift_days_limit`): the current invoice is
//!   written off as lost revenue and the payment moves to the next period's
//!   invoice. Service runs to the end of the next period.
//! - **Prorated** (more days left): the current invoice is marked paid and
//!   keeps the payment. Service runs to the period end plus grace days, and a
//!   [`BillingAdjustment`] records the proportional amount for a human to act
//!   on. The provider never gives away more than the gift tail for free.
//!
//! Settlement, including the flip back to `active`, is committed as one unit.
//! The [`SuspensionCoordinator`] is then asked to reactivate exactly once to
//! re-enable the network credential; its failure never undoes the settlement.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::ReactivationPolicy;
use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceService;
use crate::locks::ClientLocks;
use crate::models::{
    BillingAdjustment, BillingProfile, ClientStatus, Invoice, InvoiceStatus, Payment,
    PaymentStatus,
};
use crate::notifications::{NotificationRequest, NotificationSink};
use crate::period::{add_days, period_for, Period};
use crate::store::{BillingStore, BillingWrite, UnitOfWork};
use crate::suspension::SuspensionCoordinator;

/// A payment recorded for a client who fell behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatePaymentRequest {
    pub client_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    /// An already-recorded payment. Its stored amount and date take precedence.
    #[serde(default)]
    pub payment_id: Option<Uuid>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationStrategy {
    Gift,
    Prorated,
}

impl ReactivationStrategy {
    /// The decision rule. `days_remaining == limit` is still a gift.
    pub fn choose(days_remaining: i64, policy: &ReactivationPolicy) -> Self {
        if days_remaining <= policy.auto_gift_days_limit {
            ReactivationStrategy::Gift
        } else {
            ReactivationStrategy::Prorated
        }
    }
}

/// Share of a monthly amount for `days` days, never below the chargeable minimum
pub fn proportional_amount(amount: Decimal, days: i64, policy: &ReactivationPolicy) -> Decimal {
    let chargeable = days.max(policy.minimum_chargeable_days);
    (amount / Decimal::from(policy.days_per_month_basis) * Decimal::from(chargeable)).round_dp(2)
}

/// What a late payment did
#[derive(Debug, Clone, Serialize)]
pub struct ReactivationOutcome {
    pub client_id: Uuid,
    pub payment_id: Uuid,
    pub strategy: ReactivationStrategy,
    pub period: Period,
    pub days_remaining: i64,
    /// Invoice of the period containing the payment date
    pub current_invoice_id: Uuid,
    pub current_invoice_status: InvoiceStatus,
    /// Invoice the payment ended up attached to
    pub applied_invoice_id: Uuid,
    pub applied_invoice_status: InvoiceStatus,
    pub proportional_amount: Option<Decimal>,
    pub service_end_date: NaiveDate,
    pub requires_manual_adjustment: bool,
    pub remote_action_applied: bool,
}

/// Late-payment reactivation engine
pub struct LatePaymentEngine {
    store: Arc<dyn BillingStore>,
    invoices: InvoiceService,
    coordinator: Arc<dyn SuspensionCoordinator>,
    notifier: Arc<dyn NotificationSink>,
    locks: Arc<ClientLocks>,
    policy: ReactivationPolicy,
}

/// Invoice for a period, either already stored or about to be
struct Resolved {
    invoice: Invoice,
    writes: Vec<BillingWrite>,
}

impl LatePaymentEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        invoices: InvoiceService,
        coordinator: Arc<dyn SuspensionCoordinator>,
        notifier: Arc<dyn NotificationSink>,
        locks: Arc<ClientLocks>,
        policy: ReactivationPolicy,
    ) -> Self {
        Self {
            store,
            invoices,
            coordinator,
            notifier,
            locks,
            policy,
        }
    }

    pub fn policy(&self) -> &ReactivationPolicy {
        &self.policy
    }

    /// Settle a late payment and reactivate the client.
    ///
    /// Errors leave nothing written: the settlement either commits whole or not at all.
    pub async fn process(
        &self,
        request: LatePaymentRequest,
        today: NaiveDate,
    ) -> BillingResult<ReactivationOutcome> {
        let client_id = request.client_id;
        let _guard = self.locks.acquire(client_id).await;

        self.store
            .get_client(client_id)
            .await?
            .ok_or(BillingError::ClientNotFound(client_id))?;
        let profile = self
            .store
            .get_profile(client_id)
            .await?
            .ok_or(BillingError::NoBillingProfile(client_id))?;
        self.store
            .active_subscription(client_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(client_id))?;

        let mut unit = UnitOfWork::new(client_id);
        let payment = self.resolve_payment(&request, &mut unit).await?;
        if payment.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "payment amount must be positive, got {}",
                payment.amount
            )));
        }

        if !self.is_late(&profile, payment.payment_date).await? {
            return Err(BillingError::PaymentNotLate(client_id));
        }

        let period = period_for(profile.billing_day, payment.payment_date)?;
        let days_remaining = period.days_remaining(payment.payment_date);
        let strategy = ReactivationStrategy::choose(days_remaining, &self.policy);

        // Writes for invoice creation come first so later status changes can reference them
        let current = self.resolve_invoice(&profile, &period, today, None).await?;
        let mut cursor = profile.clone();
        cursor.next_due_date = current
            .writes
            .iter()
            .find_map(|w| match w {
                BillingWrite::SetNextDueDate { next_due_date, .. } => Some(*next_due_date),
                _ => None,
            })
            .unwrap_or(profile.next_due_date);
        let current_invoice = current.invoice.clone();
        let current_writes = current.writes;

        let (settlement, outcome_parts) = match strategy {
            ReactivationStrategy::Gift => {
                let next_period = period.following(profile.billing_day)?;
                let next = self
                    .resolve_invoice(&cursor, &next_period, today, Some(current_invoice.id))
                    .await?;
                let next_status = if payment.amount >= next.invoice.total_amount {
                    InvoiceStatus::Paid
                } else {
                    InvoiceStatus::PartialPaid
                };

                let mut writes = next.writes;
                writes.push(BillingWrite::SetInvoiceStatus {
                    invoice_id: current_invoice.id,
                    status: InvoiceStatus::LostRevenue,
                });
                writes.push(BillingWrite::AssignPayment {
                    payment_id: payment.id,
                    invoice_id: next.invoice.id,
                });
                writes.push(BillingWrite::SetInvoiceStatus {
                    invoice_id: next.invoice.id,
                    status: next_status,
                });

                (
                    writes,
                    Settled {
                        current_status: InvoiceStatus::LostRevenue,
                        applied_invoice_id: next.invoice.id,
                        applied_status: next_status,
                        proportional_amount: None,
                        service_end_date: next_period.end,
                        requires_manual_adjustment: false,
                    },
                )
            }
            ReactivationStrategy::Prorated => {
                let amount =
                    proportional_amount(current_invoice.amount, days_remaining, &self.policy);
                let service_end_date = add_days(period.end, profile.grace_days)?;

                let writes = vec![
                    BillingWrite::SetInvoiceStatus {
                        invoice_id: current_invoice.id,
                        status: InvoiceStatus::Paid,
                    },
                    BillingWrite::AssignPayment {
                        payment_id: payment.id,
                        invoice_id: current_invoice.id,
                    },
                    BillingWrite::InsertAdjustment(BillingAdjustment {
                        id: Uuid::new_v4(),
                        client_id,
                        invoice_id: current_invoice.id,
                        payment_id: payment.id,
                        proportional_amount: amount,
                        days_remaining,
                        reason: format!(
                            "Late payment on {} with {} days left in {}; service extended to {}",
                            payment.payment_date, days_remaining, period, service_end_date
                        ),
                        resolved: false,
                        created_at: OffsetDateTime::now_utc(),
                    }),
                ];

                (
                    writes,
                    Settled {
                        current_status: InvoiceStatus::Paid,
                        applied_invoice_id: current_invoice.id,
                        applied_status: InvoiceStatus::Paid,
                        proportional_amount: Some(amount),
                        service_end_date,
                        requires_manual_adjustment: true,
                    },
                )
            }
        };

        for write in current_writes {
            unit.push(write);
        }
        for write in settlement {
            unit.push(write);
        }
        unit.push(BillingWrite::SetServiceEndDate {
            client_id,
            service_end_date: outcome_parts.service_end_date,
        });
        if profile.client_status != ClientStatus::Active {
            unit.push(BillingWrite::SetClientStatus {
                client_id,
                status: ClientStatus::Active,
            });
        }
        self.store.commit(unit).await?;

        // Billing state is settled; from here on only the remote credential is at stake
        let remote_action_applied = match self.coordinator.reactivate(client_id, payment.id).await {
            Ok(reactivation) => reactivation.remote_action_applied,
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    payment_id = %payment.id,
                    error = %e,
                    "Reactivation after settlement failed; client already active in billing"
                );
                false
            }
        };

        self.notifier
            .enqueue(NotificationRequest::service_reactivated(
                client_id,
                payment.id,
                outcome_parts.service_end_date,
            ))
            .await;

        tracing::info!(
            client_id = %client_id,
            payment_id = %payment.id,
            strategy = ?strategy,
            days_remaining,
            service_end_date = %outcome_parts.service_end_date,
            requires_manual_adjustment = outcome_parts.requires_manual_adjustment,
            remote_action_applied,
            "Late payment reconciled"
        );

        Ok(ReactivationOutcome {
            client_id,
            payment_id: payment.id,
            strategy,
            period,
            days_remaining,
            current_invoice_id: current_invoice.id,
            current_invoice_status: outcome_parts.current_status,
            applied_invoice_id: outcome_parts.applied_invoice_id,
            applied_invoice_status: outcome_parts.applied_status,
            proportional_amount: outcome_parts.proportional_amount,
            service_end_date: outcome_parts.service_end_date,
            requires_manual_adjustment: outcome_parts.requires_manual_adjustment,
            remote_action_applied,
        })
    }

    /// Suspended or in grace, or holding an invoice that was due before the payment
    async fn is_late(&self, profile: &BillingProfile, payment_date: NaiveDate) -> BillingResult<bool> {
        if matches!(
            profile.client_status,
            ClientStatus::Suspended | ClientStatus::GracePeriod
        ) {
            return Ok(true);
        }
        Ok(self
            .store
            .unpaid_invoices(profile.client_id)
            .await?
            .iter()
            .any(|invoice| invoice.is_overdue_on(payment_date)))
    }

    async fn resolve_payment(
        &self,
        request: &LatePaymentRequest,
        unit: &mut UnitOfWork,
    ) -> BillingResult<Payment> {
        if let Some(payment_id) = request.payment_id {
            let payment = self
                .store
                .get_payment(payment_id)
                .await?
                .ok_or(BillingError::PaymentNotFound(payment_id))?;
            if payment.client_id != request.client_id {
                return Err(BillingError::PaymentNotFound(payment_id));
            }
            return Ok(payment);
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            client_id: request.client_id,
            invoice_id: None,
            amount: request.amount,
            payment_date: request.payment_date,
            status: PaymentStatus::Completed,
            reference: request.reference.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        unit.push(BillingWrite::InsertPayment(payment.clone()));
        Ok(payment)
    }

    /// Find the period's invoice or prepare one. `keep` is never superseded.
    async fn resolve_invoice(
        &self,
        profile: &BillingProfile,
        period: &Period,
        today: NaiveDate,
        keep: Option<Uuid>,
    ) -> BillingResult<Resolved> {
        if let Some(invoice) = self
            .invoices
            .find_period_invoice(profile.client_id, period)
            .await?
        {
            return Ok(Resolved {
                invoice,
                writes: Vec::new(),
            });
        }

        let mut prepared = self
            .invoices
            .prepare_invoice(profile, period, today)
            .await?
            .ok_or(BillingError::NoActiveSubscription(profile.client_id))?;
        if let Some(keep) = keep {
            prepared.superseded.retain(|old| old.id != keep);
        }

        Ok(Resolved {
            invoice: prepared.invoice.clone(),
            writes: prepared.into_writes(),
        })
    }
}

struct Settled {
    current_status: InvoiceStatus,
    applied_invoice_id: Uuid,
    applied_status: InvoiceStatus,
    proportional_amount: Option<Decimal>,
    service_end_date: NaiveDate,
    requires_manual_adjustment: bool,
}
