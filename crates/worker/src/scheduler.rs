//! Billing job scheduler
//!
//! Owns the explicit list of `(trigger, job)` pairs and the cron scheduler
//! running them. Disabled triggers are left out of the list entirely.

use chrono::NaiveDate;
use netbill_billing::{BillingEngine, JobTrigger, PipelineStep, ScheduleConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

/// The four scheduled billing jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingJob {
    /// The full five-step pipeline
    DailyReconciliation,
    /// Missed and upcoming invoices only
    InvoiceGeneration,
    Reminders,
    SuspensionCheck,
}

impl BillingJob {
    pub const ALL: [BillingJob; 4] = [
        BillingJob::DailyReconciliation,
        BillingJob::InvoiceGeneration,
        BillingJob::Reminders,
        BillingJob::SuspensionCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BillingJob::DailyReconciliation => "daily_reconciliation",
            BillingJob::InvoiceGeneration => "invoice_generation",
            BillingJob::Reminders => "reminders",
            BillingJob::SuspensionCheck => "suspension_check",
        }
    }

    pub fn trigger<'a>(&self, schedule: &'a ScheduleConfig) -> &'a JobTrigger {
        match self {
            BillingJob::DailyReconciliation => &schedule.daily_reconciliation,
            BillingJob::InvoiceGeneration => &schedule.invoice_generation,
            BillingJob::Reminders => &schedule.reminders,
            BillingJob::SuspensionCheck => &schedule.suspension_check,
        }
    }

    /// Pipeline steps the job runs, in order
    pub fn steps(&self) -> &'static [PipelineStep] {
        match self {
            BillingJob::DailyReconciliation => &PipelineStep::ALL,
            BillingJob::InvoiceGeneration => {
                &[PipelineStep::RecoverMissed, PipelineStep::GenerateUpcoming]
            }
            BillingJob::Reminders => &[PipelineStep::RemindUpcoming],
            BillingJob::SuspensionCheck => &[PipelineStep::SuspendOverdue],
        }
    }

    /// Run the job for `today`. Never fails: per-client errors are counted and logged.
    pub async fn run(&self, engine: &BillingEngine, today: NaiveDate) -> JobSummary {
        let mut summary = JobSummary {
            job: *self,
            run_date: today,
            writes: 0,
            errors: 0,
        };

        if *self == BillingJob::DailyReconciliation {
            let report = engine.pipeline.run_daily(today).await;
            summary.writes = report.total_writes();
            summary.errors = report.total_errors();
        } else {
            for step in self.steps() {
                let report = engine.pipeline.run_step(*step, today).await;
                summary.writes += report.writes();
                summary.errors += report.errors.len();
            }
        }

        if summary.errors > 0 {
            warn!(
                job = self.name(),
                run_date = %today,
                writes = summary.writes,
                errors = summary.errors,
                "Billing job finished with client failures"
            );
        } else {
            info!(
                job = self.name(),
                run_date = %today,
                writes = summary.writes,
                "Billing job complete"
            );
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job: BillingJob,
    pub run_date: NaiveDate,
    pub writes: usize,
    pub errors: usize,
}

/// One enabled job and when it fires
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job: BillingJob,
    pub trigger: JobTrigger,
}

impl ScheduledJob {
    pub fn cron_expression(&self) -> String {
        self.trigger.cron_expression()
    }
}

/// Enabled jobs for a schedule, in [`BillingJob::ALL`] order
pub fn scheduled_jobs(schedule: &ScheduleConfig) -> Vec<ScheduledJob> {
    BillingJob::ALL
        .into_iter()
        .filter_map(|job| {
            let trigger = job.trigger(schedule);
            if trigger.enabled {
                Some(ScheduledJob {
                    job,
                    trigger: trigger.clone(),
                })
            } else {
                info!(job = job.name(), "Job disabled, not scheduling");
                None
            }
        })
        .collect()
}

pub struct BillingScheduler {
    engine: BillingEngine,
    jobs: Vec<ScheduledJob>,
    scheduler: Option<JobScheduler>,
    job_ids: Vec<Uuid>,
}

impl BillingScheduler {
    pub fn new(engine: BillingEngine) -> Self {
        let jobs = scheduled_jobs(&engine.config.schedule);
        Self {
            engine,
            jobs,
            scheduler: None,
            job_ids: Vec::new(),
        }
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Register every enabled job and start firing them
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.scheduler.is_some() {
            warn!("Billing scheduler already running");
            return Ok(());
        }

        let scheduler = JobScheduler::new().await?;

        for scheduled in &self.jobs {
            let job = scheduled.job;
            let engine = self.engine.clone();
            let cron = scheduled.cron_expression();

            let id = scheduler
                .add(Job::new_async_tz(
                    cron.as_str(),
                    scheduled.trigger.timezone,
                    move |_uuid, _l| {
                        let engine = engine.clone();
                        Box::pin(async move {
                            let today = engine.config.today();
                            info!(job = job.name(), run_date = %today, "Running scheduled billing job");
                            job.run(&engine, today).await;
                        })
                    },
                )?)
                .await?;

            self.job_ids.push(id);
            info!(
                job = job.name(),
                cron = %cron,
                timezone = %scheduled.trigger.timezone,
                "Scheduled billing job"
            );
        }

        scheduler.start().await?;
        info!(jobs = self.job_ids.len(), "Billing scheduler started");
        self.scheduler = Some(scheduler);
        Ok(())
    }

    /// Stop firing jobs. A job already running finishes on its own.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut scheduler) = self.scheduler.take() else {
            return Ok(());
        };
        if let Err(e) = scheduler.shutdown().await {
            error!(error = %e, "Billing scheduler shutdown failed");
            return Err(e.into());
        }
        self.job_ids.clear();
        info!("Billing scheduler stopped");
        Ok(())
    }
}
