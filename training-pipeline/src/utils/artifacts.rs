use std::path::{Path, PathBuf};

use common::error::AppError;
use tracing::debug;

use crate::models::TrainedModel;

pub fn artifact_path(models_dir: &Path, job_id: &str) -> PathBuf {
    models_dir.join(format!("{job_id}_model.json"))
}

/// Writes the fitted model as JSON and returns the path it was written to.
pub async fn save_model(
    models_dir: &Path,
    job_id: &str,
    model: &TrainedModel,
) -> Result<String, AppError> {
    tokio::fs::create_dir_all(models_dir).await?;

    let path = artifact_path(models_dir, job_id);
    let encoded = serde_json::to_vec(model)?;
    tokio::fs::write(&path, encoded).await?;

    debug!(%job_id, path = %path.display(), "model artifact written");
    Ok(path.to_string_lossy().into_owned())
}

pub async fn load_model(path: &Path) -> Result<TrainedModel, AppError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
