// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries sqlx errors by value
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NetBill Billing Engine
//!
//! Runs an ISP's subscriber billing cycle against a per-client billing day.
//!
//! ## Features
//!
//! - **Period Calculator**: billing periods over irregular month lengths
//! - **Invoice Lifecycle**: create, supersede and number invoices, advance due dates
//! - **Daily Reconciliation**: backfill, recover, pre-generate, suspend, remind
//! - **Late-Payment Reactivation**: gift or prorate the remaining days of a period
//! - **Suspension Coordination**: billing status first, network access best-effort
//! - **Invariants**: read-only consistency checks for operators

pub mod config;
pub mod error;
pub mod invariants;
pub mod invoices;
pub mod locks;
pub mod models;
pub mod notifications;
pub mod period;
pub mod pipeline;
pub mod reactivation;
pub mod store;
pub mod suspension;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Config
pub use config::{
    BillingConfig, Environment, JobTrigger, ReactivationPolicy, RemoteAccessConfig,
    ScheduleConfig,
};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{InvoiceService, PreparedInvoice};

// Locks
pub use locks::ClientLocks;

// Models
pub use models::{
    BillingAdjustment, BillingProfile, Client, ClientStatus, Invoice, InvoiceStatus,
    NotificationEntry, NotificationPriority, NotificationStatus, NotificationType, Payment,
    PaymentStatus, Subscription, SubscriptionStatus,
};

// Notifications
pub use notifications::{NotificationRequest, NotificationSink, QueueNotificationSink};

// Period
pub use period::{adjusted_day, last_day_of_month, period_for, Period};

// Pipeline
pub use pipeline::{
    ClientFailure, PipelineReport, PipelineSettings, PipelineStep, ReconciliationPipeline,
    StepReport,
};

// Reactivation
pub use reactivation::{
    LatePaymentEngine, LatePaymentRequest, ReactivationOutcome, ReactivationStrategy,
};

// Store
pub use store::{
    create_pool, BillingStore, BillingWrite, InMemoryBillingStore, PgBillingStore, ProfileQuery,
    UnitOfWork,
};

// Suspension
pub use suspension::{
    AccessController, HttpAccessController, NetworkSuspensionCoordinator, NoopAccessController,
    SuspensionCoordinator, SuspensionOutcome,
};

/// Main billing engine that wires every component to one store and one config
#[derive(Clone)]
pub struct BillingEngine {
    pub config: BillingConfig,
    pub store: Arc<dyn BillingStore>,
    pub invoices: InvoiceService,
    pub coordinator: Arc<dyn SuspensionCoordinator>,
    pub notifier: Arc<dyn NotificationSink>,
    pub pipeline: Arc<ReconciliationPipeline>,
    pub reactivation: Arc<LatePaymentEngine>,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingEngine {
    /// Create the engine with the access controller the config selects
    pub fn new(config: BillingConfig, store: Arc<dyn BillingStore>) -> BillingResult<Self> {
        config.policy.validate()?;
        let access = suspension::access_controller_from_config(&config.remote)?;
        let coordinator = Arc::new(NetworkSuspensionCoordinator::new(
            store.clone(),
            access,
            config.remote.timeout,
        ));
        Ok(Self::with_coordinator(config, store, coordinator))
    }

    /// Create the engine around an explicit suspension coordinator
    pub fn with_coordinator(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        coordinator: Arc<dyn SuspensionCoordinator>,
    ) -> Self {
        let invoices = InvoiceService::new(store.clone(), &config);
        let notifier: Arc<dyn NotificationSink> =
            Arc::new(QueueNotificationSink::new(store.clone()));
        let locks = Arc::new(ClientLocks::new());

        let pipeline = Arc::new(ReconciliationPipeline::new(
            store.clone(),
            invoices.clone(),
            coordinator.clone(),
            notifier.clone(),
            locks.clone(),
            PipelineSettings {
                invoice_lookahead_days: config.invoice_lookahead_days,
                reminder_window_days: config.reminder_window_days,
                max_recovery_periods: config.max_recovery_periods,
            },
        ));
        let reactivation = Arc::new(LatePaymentEngine::new(
            store.clone(),
            invoices.clone(),
            coordinator.clone(),
            notifier.clone(),
            locks,
            config.policy,
        ));
        let invariants = Arc::new(InvariantChecker::new(store.clone()));

        Self {
            config,
            store,
            invoices,
            coordinator,
            notifier,
            pipeline,
            reactivation,
            invariants,
        }
    }
}
