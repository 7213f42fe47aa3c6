//! Billing error types

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Broad class of a [`BillingError`].
///
/// The reconciliation pipeline uses this to decide whether a client is skipped
/// quietly, recorded as a failure, or whether the operation must be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing data for a client (no profile, no active subscription)
    Configuration,
    /// A read or write against the store failed
    Persistence,
    /// The remote network access layer failed or timed out
    RemoteAction,
    /// A programming or configuration defect (bad billing day, bad policy)
    Policy,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Client not found: {0}")]
    ClientNotFound(Uuid),

    #[error("No billing profile for client {0}")]
    NoBillingProfile(Uuid),

    #[error("No active subscription for client {0}")]
    NoActiveSubscription(Uuid),

    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Remote access action failed: {0}")]
    RemoteAction(String),

    #[error("Remote access action timed out after {0} seconds")]
    RemoteTimeout(u64),

    #[error("Date out of range: {0}")]
    DateOutOfRange(String),

    #[error("Invalid billing day {0}: must be between 1 and 31")]
    InvalidBillingDay(u32),

    #[error("Invalid reactivation policy: {0}")]
    InvalidPolicy(String),

    #[error("Unknown pipeline step: {0}")]
    UnknownStep(String),

    #[error("Payment for client {0} is not late: client is neither suspended nor overdue")]
    PaymentNotLate(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::ClientNotFound(_)
            | BillingError::NoBillingProfile(_)
            | BillingError::NoActiveSubscription(_)
            | BillingError::PaymentNotFound(_)
            | BillingError::Config(_) => ErrorKind::Configuration,
            BillingError::Database(_) | BillingError::Migration(_) | BillingError::Store(_) => {
                ErrorKind::Persistence
            }
            BillingError::RemoteAction(_) | BillingError::RemoteTimeout(_) => {
                ErrorKind::RemoteAction
            }
            BillingError::InvalidBillingDay(_)
            | BillingError::DateOutOfRange(_)
            | BillingError::InvalidPolicy(_)
            | BillingError::UnknownStep(_)
            | BillingError::PaymentNotLate(_)
            | BillingError::InvalidAmount(_) => ErrorKind::Policy,
        }
    }

    /// Whether a pipeline may skip the client and carry on without reporting a failure
    pub fn is_skippable(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}
