//! Job polling endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use super::{ApiError, ApiResult, AppState};
use crate::jobs::JobView;

/// GET /jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": state.jobs().list() }))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = state
        .jobs()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))?;
    Ok(Json(job.view()))
}
