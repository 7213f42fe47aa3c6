//! Daily reconciliation pipeline
//!
//! Five steps, always in this order:
//!
//! 1. [`PipelineStep::BackfillCurrent`]: every active client gets an invoice for the current period
//! 2. [`PipelineStep::RecoverMissed`]: walk lagging `next_due_date` cursors forward, invoicing missed periods
//! 3. [`PipelineStep::GenerateUpcoming`]: invoice periods due within the look-ahead window
//! 4. [`PipelineStep::SuspendOverdue`]: suspend active clients past their due date
//! 5. [`PipelineStep::RemindUpcoming`]: queue reminders for payments due within the reminder window
//!
//! Clients are processed one at a time under their [`ClientLocks`] entry. A
//! failing client is recorded in the step's report and the step moves on.
//! Every write path checks for existing state first, so running the pipeline
//! twice in a day leaves the same state as running it once.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::invoices::{period_due_on, InvoiceService};
use crate::locks::ClientLocks;
use crate::models::{BillingProfile, ClientStatus};
use crate::notifications::{NotificationRequest, NotificationSink};
use crate::period::period_for;
use crate::store::{BillingStore, BillingWrite, ProfileQuery, UnitOfWork};
use crate::suspension::SuspensionCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    BackfillCurrent,
    RecoverMissed,
    GenerateUpcoming,
    SuspendOverdue,
    RemindUpcoming,
}

impl PipelineStep {
    /// Execution order of a full run
    pub const ALL: [PipelineStep; 5] = [
        PipelineStep::BackfillCurrent,
        PipelineStep::RecoverMissed,
        PipelineStep::GenerateUpcoming,
        PipelineStep::SuspendOverdue,
        PipelineStep::RemindUpcoming,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::BackfillCurrent => "backfill_current",
            PipelineStep::RecoverMissed => "recover_missed",
            PipelineStep::GenerateUpcoming => "generate_upcoming",
            PipelineStep::SuspendOverdue => "suspend_overdue",
            PipelineStep::RemindUpcoming => "remind_upcoming",
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStep {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        PipelineStep::ALL
            .into_iter()
            .find(|step| step.as_str() == normalized)
            .ok_or_else(|| BillingError::UnknownStep(s.to_string()))
    }
}

/// One client (or the step's profile listing) that failed
#[derive(Debug, Clone, Serialize)]
pub struct ClientFailure {
    /// `None` when the step could not list profiles at all
    pub client_id: Option<Uuid>,
    pub step: PipelineStep,
    pub error: String,
}

/// Counts for one step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: PipelineStep,
    pub examined: usize,
    pub created: usize,
    pub recovered: usize,
    /// Cursors moved past an invoice that already existed
    pub realigned: usize,
    pub skipped: usize,
    pub suspended: usize,
    pub reminded: usize,
    pub remote_failures: usize,
    pub errors: Vec<ClientFailure>,
}

impl StepReport {
    fn new(step: PipelineStep) -> Self {
        Self {
            step,
            examined: 0,
            created: 0,
            recovered: 0,
            realigned: 0,
            skipped: 0,
            suspended: 0,
            reminded: 0,
            remote_failures: 0,
            errors: Vec::new(),
        }
    }

    /// Invoices, suspensions and reminders written by the step
    pub fn writes(&self) -> usize {
        self.created + self.recovered + self.realigned + self.suspended + self.reminded
    }

    fn record(&mut self, client_id: Option<Uuid>, error: &BillingError) {
        self.errors.push(ClientFailure {
            client_id,
            step: self.step,
            error: error.to_string(),
        });
    }
}

/// Result of a full run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_date: NaiveDate,
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    pub fn total_errors(&self) -> usize {
        self.steps.iter().map(|s| s.errors.len()).sum()
    }

    pub fn total_writes(&self) -> usize {
        self.steps.iter().map(StepReport::writes).sum()
    }

    pub fn step(&self, step: PipelineStep) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }
}

/// Window settings for the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub invoice_lookahead_days: u32,
    pub reminder_window_days: u32,
    pub max_recovery_periods: u32,
}

pub struct ReconciliationPipeline {
    store: Arc<dyn BillingStore>,
    invoices: InvoiceService,
    coordinator: Arc<dyn SuspensionCoordinator>,
    notifier: Arc<dyn NotificationSink>,
    locks: Arc<ClientLocks>,
    settings: PipelineSettings,
    run_lock: Mutex<()>,
}

fn plus_days(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX)
}

impl ReconciliationPipeline {
    pub fn new(
        store: Arc<dyn BillingStore>,
        invoices: InvoiceService,
        coordinator: Arc<dyn SuspensionCoordinator>,
        notifier: Arc<dyn NotificationSink>,
        locks: Arc<ClientLocks>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            invoices,
            coordinator,
            notifier,
            locks,
            settings,
            run_lock: Mutex::new(()),
        }
    }

    /// Run all five steps in order
    pub async fn run_daily(&self, today: NaiveDate) -> PipelineReport {
        let _run = self.run_lock.lock().await;
        tracing::info!(run_date = %today, "Starting daily billing reconciliation");

        let mut steps = Vec::with_capacity(PipelineStep::ALL.len());
        for step in PipelineStep::ALL {
            steps.push(self.execute(step, today).await);
        }

        let report = PipelineReport {
            run_date: today,
            steps,
        };
        tracing::info!(
            run_date = %today,
            writes = report.total_writes(),
            errors = report.total_errors(),
            "Daily billing reconciliation complete"
        );
        report
    }

    /// Run a single step on demand
    pub async fn run_step(&self, step: PipelineStep, today: NaiveDate) -> StepReport {
        let _run = self.run_lock.lock().await;
        self.execute(step, today).await
    }

    async fn execute(&self, step: PipelineStep, today: NaiveDate) -> StepReport {
        let mut report = StepReport::new(step);

        let query = match step {
            PipelineStep::BackfillCurrent | PipelineStep::RemindUpcoming => {
                ProfileQuery::with_statuses(&[ClientStatus::Active])
            }
            PipelineStep::RecoverMissed => {
                ProfileQuery::with_statuses(&ClientStatus::BILLABLE).due_on_or_before(today)
            }
            PipelineStep::GenerateUpcoming => ProfileQuery::with_statuses(&ClientStatus::BILLABLE)
                .due_after(today)
                .due_on_or_before(plus_days(today, self.settings.invoice_lookahead_days)),
            PipelineStep::SuspendOverdue => {
                ProfileQuery::with_statuses(&[ClientStatus::Active, ClientStatus::GracePeriod])
            }
        };

        let profiles = match self.store.list_profiles(&query).await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::error!(step = %step, error = %e, "Failed to list billing profiles");
                report.record(None, &e);
                return report;
            }
        };

        for listed in profiles {
            let client_id = listed.client_id;
            let _guard = self.locks.acquire(client_id).await;
            report.examined += 1;

            // Re-read under the lock; earlier steps or a payment may have moved it
            let result = match self.store.get_profile(client_id).await {
                Ok(Some(profile)) => self.process(step, &profile, today, &mut report).await,
                Ok(None) => Err(BillingError::NoBillingProfile(client_id)),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if e.is_skippable() {
                    tracing::debug!(step = %step, client_id = %client_id, reason = %e, "Client skipped");
                    report.skipped += 1;
                } else {
                    tracing::error!(step = %step, client_id = %client_id, error = %e, "Client failed");
                    report.record(Some(client_id), &e);
                }
            }
        }

        tracing::info!(
            step = %step,
            examined = report.examined,
            created = report.created,
            recovered = report.recovered,
            realigned = report.realigned,
            skipped = report.skipped,
            suspended = report.suspended,
            reminded = report.reminded,
            remote_failures = report.remote_failures,
            errors = report.errors.len(),
            "Pipeline step complete"
        );
        report
    }

    async fn process(
        &self,
        step: PipelineStep,
        profile: &BillingProfile,
        today: NaiveDate,
        report: &mut StepReport,
    ) -> BillingResult<()> {
        match step {
            PipelineStep::BackfillCurrent => self.backfill_current(profile, today, report).await,
            PipelineStep::RecoverMissed => self.recover_missed(profile, today, report).await,
            PipelineStep::GenerateUpcoming => self.generate_upcoming(profile, today, report).await,
            PipelineStep::SuspendOverdue => self.suspend_overdue(profile, today, report).await,
            PipelineStep::RemindUpcoming => self.remind_upcoming(profile, today, report).await,
        }
    }

    /// Always invoices a missing current period, whatever the last payment date
    async fn backfill_current(
        &self,
        profile: &BillingProfile,
        today: NaiveDate,
        report: &mut StepReport,
    ) -> BillingResult<()> {
        if profile.client_status != ClientStatus::Active {
            return Ok(());
        }
        let client = self
            .store
            .get_client(profile.client_id)
            .await?
            .ok_or(BillingError::ClientNotFound(profile.client_id))?;
        if !client.is_active {
            report.skipped += 1;
            return Ok(());
        }

        let period = period_for(profile.billing_day, today)?;
        if self
            .invoices
            .find_period_invoice(profile.client_id, &period)
            .await?
            .is_some()
        {
            return Ok(());
        }

        match self
            .invoices
            .create_invoice_for_profile(profile, &period, today)
            .await?
        {
            Some(_) => report.created += 1,
            None => report.skipped += 1,
        }
        Ok(())
    }

    async fn recover_missed(
        &self,
        profile: &BillingProfile,
        today: NaiveDate,
        report: &mut StepReport,
    ) -> BillingResult<()> {
        let mut profile = profile.clone();
        let mut walked = 0;

        while profile.next_due_date <= today {
            if walked == self.settings.max_recovery_periods {
                tracing::warn!(
                    client_id = %profile.client_id,
                    next_due_date = %profile.next_due_date,
                    limit = self.settings.max_recovery_periods,
                    "Recovery limit reached; the next run continues from here"
                );
                break;
            }
            walked += 1;

            let period = period_due_on(&profile, profile.next_due_date)?;
            let following_due = period
                .following(profile.billing_day)?
                .due_date(profile.grace_days)?;

            if self
                .invoices
                .find_period_invoice(profile.client_id, &period)
                .await?
                .is_some()
            {
                self.realign(&profile, following_due).await?;
                report.realigned += 1;
            } else {
                match self
                    .invoices
                    .create_invoice_for_profile(&profile, &period, today)
                    .await?
                {
                    Some(_) => report.recovered += 1,
                    None => {
                        report.skipped += 1;
                        break;
                    }
                }
            }
            profile.next_due_date = following_due;
        }
        Ok(())
    }

    async fn generate_upcoming(
        &self,
        profile: &BillingProfile,
        today: NaiveDate,
        report: &mut StepReport,
    ) -> BillingResult<()> {
        let window_end = plus_days(today, self.settings.invoice_lookahead_days);
        if !profile.client_status.is_billable()
            || profile.next_due_date <= today
            || profile.next_due_date > window_end
        {
            return Ok(());
        }

        let period = period_due_on(profile, profile.next_due_date)?;
        if self
            .invoices
            .find_period_invoice(profile.client_id, &period)
            .await?
            .is_some()
        {
            let following_due = period
                .following(profile.billing_day)?
                .due_date(profile.grace_days)?;
            self.realign(profile, following_due).await?;
            report.realigned += 1;
            return Ok(());
        }

        match self
            .invoices
            .create_invoice_for_profile(profile, &period, today)
            .await?
        {
            Some(_) => report.created += 1,
            None => report.skipped += 1,
        }
        Ok(())
    }

    async fn suspend_overdue(
        &self,
        profile: &BillingProfile,
        today: NaiveDate,
        report: &mut StepReport,
    ) -> BillingResult<()> {
        if !matches!(
            profile.client_status,
            ClientStatus::Active | ClientStatus::GracePeriod
        ) {
            return Ok(());
        }
        // A late payment granted service up to this date
        if profile.service_end_date.is_some_and(|end| end >= today) {
            tracing::debug!(
                client_id = %profile.client_id,
                service_end_date = ?profile.service_end_date,
                "Service granted by late payment; not suspending"
            );
            report.skipped += 1;
            return Ok(());
        }

        let overdue = self
            .store
            .unpaid_invoices(profile.client_id)
            .await?
            .into_iter()
            .find(|invoice| invoice.is_overdue_on(today));

        let reason = match overdue {
            Some(invoice) => format!(
                "Invoice {} overdue since {}",
                invoice.invoice_number, invoice.due_date
            ),
            None if profile.next_due_date < today => {
                format!("Billing cycle overdue since {}", profile.next_due_date)
            }
            None => return Ok(()),
        };

        let outcome = self.coordinator.suspend(profile.client_id, &reason).await?;
        if !outcome.status_changed {
            return Ok(());
        }
        report.suspended += 1;
        if !outcome.remote_action_applied {
            report.remote_failures += 1;
        }

        self.notifier
            .enqueue(NotificationRequest::service_suspended(
                profile.client_id,
                &reason,
                today,
            ))
            .await;
        Ok(())
    }

    async fn remind_upcoming(
        &self,
        profile: &BillingProfile,
        today: NaiveDate,
        report: &mut StepReport,
    ) -> BillingResult<()> {
        if profile.client_status != ClientStatus::Active {
            return Ok(());
        }
        let window_end = plus_days(today, self.settings.reminder_window_days);
        let in_window = |date: NaiveDate| today <= date && date <= window_end;

        let invoice_due = self
            .store
            .unpaid_invoices(profile.client_id)
            .await?
            .into_iter()
            .map(|invoice| invoice.due_date)
            .find(|due| in_window(*due));

        let Some(due_date) = invoice_due.or_else(|| {
            in_window(profile.next_due_date).then_some(profile.next_due_date)
        }) else {
            return Ok(());
        };

        if self
            .notifier
            .enqueue(NotificationRequest::payment_reminder(
                profile.client_id,
                due_date,
                today,
            ))
            .await
        {
            report.reminded += 1;
        }
        Ok(())
    }

    async fn realign(&self, profile: &BillingProfile, next_due_date: NaiveDate) -> BillingResult<()> {
        let mut unit = UnitOfWork::new(profile.client_id);
        unit.push(BillingWrite::SetNextDueDate {
            client_id: profile.client_id,
            next_due_date,
        });
        self.store.commit(unit).await?;
        tracing::debug!(
            client_id = %profile.client_id,
            from = %profile.next_due_date,
            to = %next_due_date,
            "Realigned next due date past an existing invoice"
        );
        Ok(())
    }
}
