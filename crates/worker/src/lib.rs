// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NetBill Background Worker
//!
//! Runs the billing cycle on a schedule:
//! - Daily reconciliation (full pipeline, 01:00 by default)
//! - Invoice generation: missed and upcoming periods (06:00)
//! - Payment reminders (09:00)
//! - Suspension check (00:30)

pub mod scheduler;

pub use scheduler::{scheduled_jobs, BillingJob, BillingScheduler, JobSummary, ScheduledJob};

/// Initialise tracing: `EnvFilter` from `RUST_LOG` (default `info`), JSON when `LOG_FORMAT=json`
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
