//! Application state

use std::sync::Arc;

use netbill_billing::BillingEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: BillingEngine,
    /// Expected bearer token for admin routes
    pub admin_token: Arc<str>,
}

impl AppState {
    pub fn new(engine: BillingEngine, admin_token: impl Into<Arc<str>>) -> Self {
        Self {
            engine,
            admin_token: admin_token.into(),
        }
    }
}
