use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    jobs::{
        events::ResourceUsage,
        model_config::{ModelConfig, TaskKind},
    },
};

use crate::{
    dataset::{load_csv, DataTable, SplitData},
    models::TrainedModel,
    utils::{artifacts, resource_monitor::ResourceMonitor},
};

/// Collaborators the runner drives. Swapped out in tests.
#[async_trait]
pub trait TrainingServices: Send + Sync {
    async fn load_dataset(&self, dataset_path: &str) -> Result<DataTable, AppError>;

    async fn fit_model(
        &self,
        config: &ModelConfig,
        task: TaskKind,
        n_classes: usize,
        split: Arc<SplitData>,
    ) -> Result<TrainedModel, AppError>;

    async fn save_model(&self, job_id: &str, model: &TrainedModel) -> Result<String, AppError>;

    fn sample_resources(&self) -> ResourceUsage;
}

pub struct DefaultTrainingServices {
    models_dir: PathBuf,
    monitor: ResourceMonitor,
}

impl DefaultTrainingServices {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            monitor: ResourceMonitor::new(),
        }
    }
}

#[async_trait]
impl TrainingServices for DefaultTrainingServices {
    async fn load_dataset(&self, dataset_path: &str) -> Result<DataTable, AppError> {
        let path = PathBuf::from(dataset_path);
        tokio::task::spawn_blocking(move || load_csv(&path)).await?
    }

    async fn fit_model(
        &self,
        config: &ModelConfig,
        task: TaskKind,
        n_classes: usize,
        split: Arc<SplitData>,
    ) -> Result<TrainedModel, AppError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            TrainedModel::fit(&config, task, n_classes, &split.x_train, &split.y_train)
        })
        .await?
    }

    async fn save_model(&self, job_id: &str, model: &TrainedModel) -> Result<String, AppError> {
        artifacts::save_model(&self.models_dir, job_id, model).await
    }

    fn sample_resources(&self) -> ResourceUsage {
        self.monitor.sample()
    }
}
