use axum::{extract::State, Json};
use common::jobs::control::{CreateJobRequest, JobSubmission};
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

pub async fn train(
    State(state): State<ApiState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<JobSubmission>, ApiError> {
    info!(
        dataset_path = %request.dataset_path,
        target_column = %request.target_column,
        task_type = request.task_type.as_str(),
        "Received training request"
    );

    let submission = state.jobs.create_job(request).await?;
    Ok(Json(submission))
}
