use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::AppError,
    jobs::model_config::{ModelConfig, TaskKind},
};

/// Everything a worker needs to run one training job.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TrainingPayload {
    pub job_id: String,
    pub dataset_path: String,
    /// Hyperparameter mapping as submitted; parsed with [`TrainingPayload::model`].
    pub model_config: Value,
    pub target_column: String,
    pub task_type: TaskKind,
}

impl TrainingPayload {
    pub fn model(&self) -> Result<ModelConfig, AppError> {
        ModelConfig::from_value(&self.model_config)
    }
}
