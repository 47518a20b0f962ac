use std::{sync::Arc, time::Instant};

use common::{
    error::AppError,
    jobs::{
        events::UpdateEvent,
        model_config::ModelConfig,
        record::{EpochRecord, JobStatus, JobStatusRecord, JobTransition, TrainingResult},
        state_store::JobStateStore,
        update_channel::UpdateChannel,
    },
    storage::{
        db::SurrealDbClient,
        types::{training_payload::TrainingPayload, training_task::TrainingTask},
    },
};
use ndarray::Array1;
use tracing::{error, info, warn};

use crate::{
    dataset::{DataTable, SplitData},
    models::TrainedModel,
};

use super::{config::TrainingConfig, services::TrainingServices};

/// Outcome of a cooperative checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Cancelled,
}

pub struct PipelineContext<'a> {
    pub task: &'a TrainingTask,
    pub task_id: String,
    pub job_id: String,
    pub attempt: u32,
    pub db: &'a SurrealDbClient,
    pub pipeline_config: &'a TrainingConfig,
    pub services: &'a dyn TrainingServices,
    pub store: &'a JobStateStore,
    pub channel: &'a UpdateChannel,
    pub payload: &'a TrainingPayload,
    pub started: Instant,
    /// Snapshot mirrored into the status store at every milestone.
    pub record: JobStatusRecord,
    pub table: Option<DataTable>,
    pub split: Option<Arc<SplitData>>,
    pub class_labels: Vec<String>,
    pub model_config: Option<ModelConfig>,
    pub total_epochs: usize,
    pub model: Option<Arc<TrainedModel>>,
    pub history: Vec<EpochRecord>,
    pub test_predictions: Option<Array1<f64>>,
    pub result: Option<TrainingResult>,
}

impl<'a> PipelineContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: &'a TrainingTask,
        db: &'a SurrealDbClient,
        pipeline_config: &'a TrainingConfig,
        services: &'a dyn TrainingServices,
        store: &'a JobStateStore,
        channel: &'a UpdateChannel,
    ) -> Self {
        let payload = &task.content;
        let mut record = JobStatusRecord::new(&payload.job_id, JobStatus::Accepted);
        record.task_id = Some(task.id.clone());
        record.created_at = Some(task.created_at);
        record.dataset_path = Some(payload.dataset_path.clone());
        record.model_config = Some(payload.model_config.clone());
        record.target_column = Some(payload.target_column.clone());
        record.task_type = Some(payload.task_type);

        Self {
            task,
            task_id: task.id.clone(),
            job_id: payload.job_id.clone(),
            attempt: task.attempts,
            db,
            pipeline_config,
            services,
            store,
            channel,
            payload,
            started: Instant::now(),
            record,
            table: None,
            split: None,
            class_labels: Vec::new(),
            model_config: None,
            total_epochs: 0,
            model: None,
            history: Vec::new(),
            test_predictions: None,
            result: None,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn split(&self) -> Result<Arc<SplitData>, AppError> {
        self.split
            .clone()
            .ok_or_else(|| AppError::InternalError("split data expected to be available".into()))
    }

    pub fn model_config(&self) -> Result<&ModelConfig, AppError> {
        self.model_config
            .as_ref()
            .ok_or_else(|| AppError::InternalError("model config expected to be available".into()))
    }

    pub fn model(&self) -> Result<Arc<TrainedModel>, AppError> {
        self.model
            .clone()
            .ok_or_else(|| AppError::InternalError("fitted model expected to be available".into()))
    }

    pub fn take_table(&mut self) -> Result<DataTable, AppError> {
        self.table
            .take()
            .ok_or_else(|| AppError::InternalError("dataset expected to be loaded".into()))
    }

    pub fn take_result(&mut self) -> Result<TrainingResult, AppError> {
        self.result
            .take()
            .ok_or_else(|| AppError::InternalError("training result expected to be available".into()))
    }

    pub async fn publish(&self, event: &UpdateEvent) {
        self.channel.publish(&self.job_id, event).await;
    }

    pub async fn write_status(&self) {
        self.store.write_status(&self.record).await;
    }

    pub async fn write_status_durable(&self) -> bool {
        self.store.write_status_durable(&self.record).await
    }

    /// Moves the snapshot along the job lifecycle.
    pub fn transition(&mut self, event: JobTransition) -> Result<(), AppError> {
        self.record.status = self.record.status.transition(event)?;
        Ok(())
    }

    /// Terminal moves always land; an unexpected source status is only logged.
    pub fn finish(&mut self, event: JobTransition, target: JobStatus) {
        if let Err(err) = self.transition(event) {
            warn!(
                job_id = %self.job_id,
                from = %self.record.status,
                to = %target,
                error = %err,
                "forcing terminal job status"
            );
            self.record.status = target;
        }
    }

    /// Records a coarse progress step and tells listeners about it.
    pub async fn milestone(&mut self, progress: u8, message: String) {
        self.record.progress = Some(progress);
        self.record.message = Some(message.clone());
        self.write_status().await;
        self.publish(&UpdateEvent::milestone(progress, message)).await;
    }

    async fn lease_held(&self) -> bool {
        match self.task.renew_lease(self.db).await {
            Ok(held) => held,
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "lease renewal failed");
                true
            }
        }
    }

    async fn revoked(&self) -> bool {
        match TrainingTask::is_revoked(self.db, &self.task_id).await {
            Ok(revoked) => revoked,
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "revocation check failed");
                false
            }
        }
    }

    /// Lease, revocation and signal checks shared by the running and paused
    /// paths. Returns `(cancelled, paused)`; an unreadable signal store counts
    /// as no signal.
    async fn stop_requested(&self) -> Result<(bool, bool), AppError> {
        let held = self.lease_held().await;
        let revoked = self.revoked().await;
        if !held && !revoked {
            return Err(AppError::Processing("Task lease lost".to_string()));
        }

        let (cancel, paused) = match self.store.read_signals(&self.job_id).await {
            Ok(signals) => (signals.cancel_requested, signals.paused),
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "signal store unreadable, continuing");
                (false, false)
            }
        };

        Ok((revoked || cancel, paused))
    }

    /// Cooperative control point. Keeps the lease alive, honours cancel and
    /// blocks here while the job is paused.
    pub async fn checkpoint(&mut self) -> Result<Checkpoint, AppError> {
        let (cancelled, paused) = self.stop_requested().await?;
        if cancelled {
            return Ok(Checkpoint::Cancelled);
        }
        if !paused {
            return Ok(Checkpoint::Proceed);
        }

        self.transition(JobTransition::Pause)?;
        self.record.message = Some("Training paused".to_string());
        self.write_status().await;
        self.publish(&UpdateEvent::status(
            JobStatus::Paused,
            "Training paused. Click Resume to continue.",
        ))
        .await;
        info!(job_id = %self.job_id, "training paused");

        loop {
            tokio::time::sleep(self.pipeline_config.tuning.pause_poll_interval).await;
            let (cancelled, paused) = self.stop_requested().await?;
            if cancelled {
                return Ok(Checkpoint::Cancelled);
            }
            if !paused {
                break;
            }
        }

        self.transition(JobTransition::Resume)?;
        self.record.message = Some("Training resumed".to_string());
        self.write_status().await;
        self.publish(&UpdateEvent::status(JobStatus::Running, "Training resumed"))
            .await;
        info!(job_id = %self.job_id, "training resumed");

        Ok(Checkpoint::Proceed)
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            task_id = %self.task_id,
            job_id = %self.job_id,
            attempt = self.attempt,
            error = %err,
            "training pipeline aborted"
        );
        err
    }
}
