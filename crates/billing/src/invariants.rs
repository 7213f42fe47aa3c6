//! Billing invariants
//!
//! Read-only consistency checks over profiles and invoices. Safe to run at any
//! time, including right after a reconciliation run or a manual step.
//!
//! ## Checks
//!
//! 1. **single_active_invoice_per_period**: at most one non-cancelled invoice per client and period
//! 2. **cancelled_has_superseding_reference**: cancelled invoices name the invoice that replaced them
//! 3. **next_due_date_not_behind**: the profile cursor is past the latest invoiced period
//! 4. **suspended_has_unpaid_invoice**: suspended clients actually owe something
//! 5. **active_has_current_invoice**: active clients are invoiced for the current period

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{BillingProfile, ClientStatus, Invoice, InvoiceStatus};
use crate::period::{period_for, Period};
use crate::store::{BillingStore, ProfileQuery};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub client_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Clients may be billed twice or not at all
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Profiles with their invoices, loaded once per check run
struct Snapshot {
    clients: Vec<(BillingProfile, Vec<Invoice>)>,
}

type Check = fn(&Snapshot, NaiveDate) -> Vec<InvariantViolation>;

const CHECKS: [(&str, Check); 5] = [
    ("single_active_invoice_per_period", single_active_invoice_per_period),
    ("cancelled_has_superseding_reference", cancelled_has_superseding_reference),
    ("next_due_date_not_behind", next_due_date_not_behind),
    ("suspended_has_unpaid_invoice", suspended_has_unpaid_invoice),
    ("active_has_current_invoice", active_has_current_invoice),
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    async fn snapshot(&self) -> BillingResult<Snapshot> {
        let profiles = self.store.list_profiles(&ProfileQuery::default()).await?;
        let mut clients = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let invoices = self.store.list_invoices(profile.client_id).await?;
            clients.push((profile, invoices));
        }
        Ok(Snapshot { clients })
    }

    /// Run all invariant checks as of `today`
    pub async fn run_all_checks(&self, today: NaiveDate) -> BillingResult<InvariantCheckSummary> {
        let snapshot = self.snapshot().await?;

        let violations: Vec<InvariantViolation> = CHECKS
            .iter()
            .flat_map(|(_, check)| check(&snapshot, today))
            .collect();

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed,
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name. Unknown names find nothing.
    pub async fn run_check(
        &self,
        name: &str,
        today: NaiveDate,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let Some((_, check)) = CHECKS.iter().find(|(n, _)| *n == name) else {
            return Ok(vec![]);
        };
        let snapshot = self.snapshot().await?;
        Ok(check(&snapshot, today))
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }
}

fn live(invoices: &[Invoice]) -> impl Iterator<Item = &Invoice> {
    invoices
        .iter()
        .filter(|i| i.status != InvoiceStatus::Cancelled)
}

fn single_active_invoice_per_period(snapshot: &Snapshot, _today: NaiveDate) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (profile, invoices) in &snapshot.clients {
        let mut per_period: HashMap<Period, Vec<&Invoice>> = HashMap::new();
        for invoice in live(invoices) {
            per_period.entry(invoice.period()).or_default().push(invoice);
        }
        for (period, dupes) in per_period.into_iter().filter(|(_, v)| v.len() > 1) {
            violations.push(InvariantViolation {
                invariant: "single_active_invoice_per_period".to_string(),
                client_ids: vec![profile.client_id],
                description: format!(
                    "Client has {} active invoices for period {} (expected 1)",
                    dupes.len(),
                    period
                ),
                context: serde_json::json!({
                    "period": period,
                    "invoice_numbers": dupes.iter().map(|i| &i.invoice_number).collect::<Vec<_>>(),
                }),
                severity: ViolationSeverity::Critical,
            });
        }
    }
    violations
}

fn cancelled_has_superseding_reference(
    snapshot: &Snapshot,
    _today: NaiveDate,
) -> Vec<InvariantViolation> {
    snapshot
        .clients
        .iter()
        .flat_map(|(profile, invoices)| {
            invoices
                .iter()
                .filter(|i| i.status == InvoiceStatus::Cancelled && i.superseded_by.is_none())
                .map(move |invoice| InvariantViolation {
                    invariant: "cancelled_has_superseding_reference".to_string(),
                    client_ids: vec![profile.client_id],
                    description: format!(
                        "Cancelled invoice {} has no superseding invoice reference",
                        invoice.invoice_number
                    ),
                    context: serde_json::json!({
                        "invoice_id": invoice.id,
                        "cancellation_reason": invoice.cancellation_reason,
                    }),
                    severity: ViolationSeverity::High,
                })
        })
        .collect()
}

fn next_due_date_not_behind(snapshot: &Snapshot, _today: NaiveDate) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (profile, invoices) in &snapshot.clients {
        let Some(latest) = live(invoices).max_by_key(|i| i.billing_period_start) else {
            continue;
        };
        let Ok(following) = latest.period().following(profile.billing_day) else {
            continue;
        };
        let Ok(expected) = following.due_date(profile.grace_days) else {
            continue;
        };
        if profile.next_due_date < expected {
            violations.push(InvariantViolation {
                invariant: "next_due_date_not_behind".to_string(),
                client_ids: vec![profile.client_id],
                description: format!(
                    "next_due_date {} is behind latest invoice {} (expected at least {})",
                    profile.next_due_date, latest.invoice_number, expected
                ),
                context: serde_json::json!({
                    "next_due_date": profile.next_due_date,
                    "latest_period": latest.period(),
                    "expected": expected,
                }),
                severity: ViolationSeverity::High,
            });
        }
    }
    violations
}

fn suspended_has_unpaid_invoice(snapshot: &Snapshot, _today: NaiveDate) -> Vec<InvariantViolation> {
    snapshot
        .clients
        .iter()
        .filter(|(profile, invoices)| {
            profile.client_status == ClientStatus::Suspended
                && !invoices.iter().any(|i| i.status.is_unpaid())
        })
        .map(|(profile, _)| InvariantViolation {
            invariant: "suspended_has_unpaid_invoice".to_string(),
            client_ids: vec![profile.client_id],
            description: "Client is suspended but owes nothing".to_string(),
            context: serde_json::json!({
                "next_due_date": profile.next_due_date,
            }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

fn active_has_current_invoice(snapshot: &Snapshot, today: NaiveDate) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (profile, invoices) in &snapshot.clients {
        if profile.client_status != ClientStatus::Active {
            continue;
        }
        let Ok(current) = period_for(profile.billing_day, today) else {
            continue;
        };
        if !live(invoices).any(|i| i.covers(&current)) {
            violations.push(InvariantViolation {
                invariant: "active_has_current_invoice".to_string(),
                client_ids: vec![profile.client_id],
                description: format!("Active client has no invoice for current period {current}"),
                context: serde_json::json!({ "period": current }),
                severity: ViolationSeverity::Medium,
            });
        }
    }
    violations
}
