//! Billing admin routes
//!
//! Manual triggers for operators: run the whole daily pipeline or any one
//! step, settle a late payment, and run the invariant checks. Every route
//! accepts an optional `?date=YYYY-MM-DD` to act as of that day instead of
//! today in the billing timezone.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use netbill_billing::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, LatePaymentRequest,
    PipelineReport, PipelineStep, ReactivationOutcome, StepReport,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AsOfQuery {
    pub date: Option<NaiveDate>,
}

impl AsOfQuery {
    fn resolve(&self, state: &AppState) -> NaiveDate {
        self.date.unwrap_or_else(|| state.engine.config.today())
    }
}

#[derive(Debug, Serialize)]
pub struct InvariantCheckResponse {
    pub check: String,
    pub healthy: bool,
    pub violations: Vec<InvariantViolation>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /admin/billing/pipeline/run
pub async fn run_pipeline(
    State(state): State<AppState>,
    Query(query): Query<AsOfQuery>,
) -> Json<PipelineReport> {
    let today = query.resolve(&state);
    tracing::info!(run_date = %today, "Manual pipeline run requested");
    Json(state.engine.pipeline.run_daily(today).await)
}

/// POST /admin/billing/steps/{step}/run
pub async fn run_step(
    State(state): State<AppState>,
    Path(step): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> ApiResult<Json<StepReport>> {
    let step: PipelineStep = step.parse()?;
    let today = query.resolve(&state);
    tracing::info!(step = %step, run_date = %today, "Manual pipeline step requested");
    Ok(Json(state.engine.pipeline.run_step(step, today).await))
}

/// POST /admin/billing/late-payments
pub async fn record_late_payment(
    State(state): State<AppState>,
    Query(query): Query<AsOfQuery>,
    Json(request): Json<LatePaymentRequest>,
) -> ApiResult<Json<ReactivationOutcome>> {
    let today = query.resolve(&state);
    let outcome = state.engine.reactivation.process(request, today).await?;
    Ok(Json(outcome))
}

/// GET /admin/billing/invariants
pub async fn run_invariants(
    State(state): State<AppState>,
    Query(query): Query<AsOfQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let today = query.resolve(&state);
    Ok(Json(state.engine.invariants.run_all_checks(today).await?))
}

/// GET /admin/billing/invariants/{name}
pub async fn run_invariant(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> ApiResult<Json<InvariantCheckResponse>> {
    if !InvariantChecker::available_checks().contains(&name.as_str()) {
        return Err(ApiError::NotFound(format!("invariant check '{name}'")));
    }
    let today = query.resolve(&state);
    let violations = state.engine.invariants.run_check(&name, today).await?;
    Ok(Json(InvariantCheckResponse {
        check: name,
        healthy: violations.is_empty(),
        violations,
    }))
}
