//! Billing run endpoints: sweep trigger, run-now and run history.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::engine::{ScheduleRunResult, SweepSummary};
use crate::models::BillingRun;
use crate::startup::AppState;

/// Body of `POST /runs`. An empty body sweeps as of today.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerSweepRequest {
    pub as_of: Option<NaiveDate>,
}

/// Run a billing sweep.
///
/// POST /runs
#[tracing::instrument(skip(state, body))]
pub async fn trigger_sweep(
    State(state): State<AppState>,
    body: Option<Json<TriggerSweepRequest>>,
) -> Result<Json<SweepSummary>, AppError> {
    let as_of = body
        .and_then(|Json(request)| request.as_of)
        .unwrap_or_else(|| Utc::now().date_naive());

    let summary = state.executor.execute_due_runs(as_of).await?;
    Ok(Json(summary))
}

/// Bill one schedule's current occurrence immediately.
///
/// POST /schedules/:id/run
#[tracing::instrument(skip(state), fields(schedule_id = %schedule_id))]
pub async fn run_schedule_now(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> Result<Json<ScheduleRunResult>, AppError> {
    let result = state.executor.run_now(schedule_id).await?;
    Ok(Json(result))
}

/// Run history of a schedule, newest first.
///
/// GET /schedules/:id/runs
#[tracing::instrument(skip(state), fields(schedule_id = %schedule_id))]
pub async fn list_schedule_runs(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> Result<Json<Vec<BillingRun>>, AppError> {
    if state.store.get_schedule(schedule_id).await?.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Schedule {} not found",
            schedule_id
        )));
    }
    let runs = state.executor.list_runs(schedule_id).await?;
    Ok(Json(runs))
}
