use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use common::jobs::control::JobCommandResponse;

use crate::{api_state::ApiState, error::ApiError};

/// Returns the stored status record exactly as the runner wrote it.
pub async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = state
        .jobs
        .store()
        .read_status_raw(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {job_id}")))?;

    Ok(([(header::CONTENT_TYPE, "application/json")], payload))
}

pub async fn pause_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobCommandResponse>, ApiError> {
    Ok(Json(state.jobs.pause(&job_id).await?))
}

pub async fn resume_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobCommandResponse>, ApiError> {
    Ok(Json(state.jobs.resume(&job_id).await?))
}

pub async fn stop_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobCommandResponse>, ApiError> {
    Ok(Json(state.jobs.cancel(&job_id).await?))
}
