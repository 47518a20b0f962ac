mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{TrainingConfig, TrainingTuning};
pub use context::Checkpoint;
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultTrainingServices, TrainingServices};
pub use stages::{calculate_epochs, epoch_metrics, epoch_progress};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    jobs::{
        events::UpdateEvent,
        record::{JobStatus, JobTransition},
        state_store::JobStateStore,
        update_channel::UpdateChannel,
    },
    storage::{
        db::SurrealDbClient,
        types::training_task::{TaskErrorInfo, TrainingTask},
    },
    utils::config::AppConfig,
};
use tracing::{debug, info, warn};

use crate::utils::round_to;

use self::{
    context::PipelineContext,
    stages::{configure_model, finalize, fit_model, load_data, simulate_epochs, split_data, Flow},
    state::ready,
};

/// How a claimed job ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Owns the full lifecycle of one training job once a worker has claimed it.
pub struct TrainingRunner {
    db: Arc<SurrealDbClient>,
    pipeline_config: TrainingConfig,
    services: Arc<dyn TrainingServices>,
    store: JobStateStore,
    channel: UpdateChannel,
}

impl TrainingRunner {
    pub fn new(db: Arc<SurrealDbClient>, config: &AppConfig) -> Result<Self, AppError> {
        Self::new_with_config(db, TrainingConfig::from_app_config(config))
    }

    pub fn new_with_config(
        db: Arc<SurrealDbClient>,
        pipeline_config: TrainingConfig,
    ) -> Result<Self, AppError> {
        let services = DefaultTrainingServices::new(pipeline_config.models_dir.clone());
        Self::with_services(db, pipeline_config, Arc::new(services))
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        pipeline_config: TrainingConfig,
        services: Arc<dyn TrainingServices>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            store: JobStateStore::new(Arc::clone(&db), pipeline_config.status_ttl),
            channel: UpdateChannel::new(Arc::clone(&db)),
            db,
            pipeline_config,
            services,
        })
    }

    pub fn store(&self) -> &JobStateStore {
        &self.store
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.pipeline_config
    }

    #[tracing::instrument(
        skip_all,
        fields(
            task_id = %task.id,
            job_id = %task.content.job_id,
            attempt = task.attempts,
            worker_id = task.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn process_task(&self, task: TrainingTask) -> Result<RunOutcome, AppError> {
        let processing_task = match task.mark_processing(&self.db).await {
            Ok(processing_task) => processing_task,
            Err(err) => {
                if TrainingTask::is_revoked(&self.db, &task.id)
                    .await
                    .unwrap_or(false)
                {
                    info!(task_id = %task.id, "training task revoked before start");
                    return Ok(RunOutcome::Cancelled);
                }
                return Err(err);
            }
        };

        let mut ctx = PipelineContext::new(
            &processing_task,
            self.db.as_ref(),
            &self.pipeline_config,
            self.services.as_ref(),
            &self.store,
            &self.channel,
        );

        match self.drive_pipeline(&mut ctx).await {
            Ok(RunOutcome::Completed) => self.record_completion(&mut ctx).await,
            Ok(RunOutcome::Cancelled) => {
                self.record_cancellation(&mut ctx).await;
                Ok(RunOutcome::Cancelled)
            }
            Err(err) => {
                debug!(
                    task_id = %ctx.task_id,
                    attempt = ctx.attempt,
                    error = %err,
                    "training pipeline failed"
                );
                self.record_failure(&mut ctx, &err).await?;
                Err(AppError::Processing(err.job_message()))
            }
        }
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    async fn drive_pipeline(&self, ctx: &mut PipelineContext<'_>) -> Result<RunOutcome, AppError> {
        ctx.transition(JobTransition::StartRunning)?;
        ctx.record.progress = Some(0);
        ctx.record.message = Some("Training started".to_string());
        ctx.write_status().await;
        ctx.publish(&UpdateEvent::Status {
            status: JobStatus::Running,
            job_id: Some(ctx.job_id.clone()),
            progress: Some(0),
            message: "Training started - Loading dataset...".to_string(),
        })
        .await;

        if ctx.checkpoint().await? == Checkpoint::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }

        let machine = ready();
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let machine = load_data(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let machine = split_data(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let machine = configure_model(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let prepare_duration = stage_start.elapsed();

        if ctx.checkpoint().await? == Checkpoint::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }

        let stage_start = Instant::now();
        let machine = fit_model(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let fit_duration = stage_start.elapsed();

        if ctx.checkpoint().await? == Checkpoint::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }

        let stage_start = Instant::now();
        let machine = match simulate_epochs(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?
        {
            Flow::Continue(machine) => machine,
            Flow::Cancelled => return Ok(RunOutcome::Cancelled),
        };
        let epochs_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let _machine = finalize(machine, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let finalize_duration = stage_start.elapsed();

        info!(
            task_id = %ctx.task_id,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            prepare_ms = Self::duration_millis(prepare_duration),
            fit_ms = Self::duration_millis(fit_duration),
            epochs_ms = Self::duration_millis(epochs_duration),
            finalize_ms = Self::duration_millis(finalize_duration),
            "training pipeline finished"
        );

        Ok(RunOutcome::Completed)
    }

    /// Writes the completed record before the `complete` event goes out. A
    /// job cancelled while it was finishing keeps its cancelled status.
    async fn record_completion(
        &self,
        ctx: &mut PipelineContext<'_>,
    ) -> Result<RunOutcome, AppError> {
        let result = ctx.take_result()?;
        let elapsed_time = round_to(ctx.elapsed_secs(), 2);
        let message = format!("Training completed in {elapsed_time:.2}s!");

        ctx.finish(JobTransition::Complete, JobStatus::Completed);
        ctx.record.progress = Some(100);
        ctx.record.elapsed_time = Some(elapsed_time);
        ctx.record.training_history = Some(ctx.history.clone());
        ctx.record.model_path = Some(result.model_path.clone());
        ctx.record.results = Some(result.clone());
        ctx.record.message = Some(message.clone());

        if !ctx.write_status_durable().await {
            let superseded = matches!(
                self.store.read_status(&ctx.job_id).await,
                Ok(Some(existing)) if existing.status.is_terminal() && existing.status != JobStatus::Completed
            );
            if superseded {
                info!(job_id = %ctx.job_id, "job finished after it was cancelled, keeping cancelled status");
                self.settle_cancelled_task(ctx).await;
                return Ok(RunOutcome::Cancelled);
            }
            warn!(job_id = %ctx.job_id, "completed status was not recorded");
        }

        ctx.publish(&UpdateEvent::Complete {
            progress: 100,
            elapsed_time,
            results: Box::new(result),
            message,
        })
        .await;

        ctx.task.mark_succeeded(ctx.db).await?;
        if let Err(err) = self.store.clear_signals(&ctx.job_id).await {
            warn!(job_id = %ctx.job_id, error = %err, "failed to clear job signals");
        }
        info!(
            task_id = %ctx.task_id,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            epochs = ctx.history.len(),
            "training task succeeded"
        );

        Ok(RunOutcome::Completed)
    }

    async fn record_cancellation(&self, ctx: &mut PipelineContext<'_>) {
        ctx.finish(JobTransition::Cancel, JobStatus::Cancelled);
        ctx.record.message = Some("Training cancelled by user".to_string());
        if !ctx.write_status_durable().await {
            warn!(job_id = %ctx.job_id, "cancelled status was not recorded");
        }
        ctx.publish(&UpdateEvent::error("Cancelled", "Training cancelled by user"))
            .await;

        self.settle_cancelled_task(ctx).await;
        info!(
            task_id = %ctx.task_id,
            job_id = %ctx.job_id,
            epochs = ctx.history.len(),
            "training task cancelled"
        );
    }

    async fn settle_cancelled_task(&self, ctx: &PipelineContext<'_>) {
        if let Err(err) = ctx.task.mark_cancelled(ctx.db).await {
            warn!(task_id = %ctx.task_id, error = %err, "failed to mark task cancelled");
        }
        if let Err(err) = self.store.clear_signals(&ctx.job_id).await {
            warn!(job_id = %ctx.job_id, error = %err, "failed to clear job signals");
        }
    }

    /// Records the failure on the job and sends the task to dead letter.
    /// Training failures are never retried.
    async fn record_failure(
        &self,
        ctx: &mut PipelineContext<'_>,
        err: &AppError,
    ) -> Result<(), AppError> {
        let reason = err.job_message();

        ctx.finish(JobTransition::Fail, JobStatus::Failed);
        ctx.record.error = Some(reason.clone());
        ctx.record.message = Some(format!("Training failed: {reason}"));
        if ctx.write_status_durable().await {
            ctx.publish(&UpdateEvent::error(
                reason.clone(),
                format!("Training failed: {reason}"),
            ))
            .await;
        } else {
            warn!(job_id = %ctx.job_id, "failed status was not recorded");
        }

        if let Err(clear_err) = self.store.clear_signals(&ctx.job_id).await {
            warn!(job_id = %ctx.job_id, error = %clear_err, "failed to clear job signals");
        }

        let error_info = TaskErrorInfo {
            code: Some(error_code(err).to_string()),
            message: reason,
        };
        let failed_task = ctx.task.mark_failed(error_info.clone(), ctx.db).await?;
        failed_task.mark_dead_letter(error_info, ctx.db).await?;
        warn!(
            task_id = %failed_task.id,
            job_id = %ctx.job_id,
            attempt = failed_task.attempts,
            "training task failed; moved to dead letter queue"
        );

        Ok(())
    }
}

fn error_code(err: &AppError) -> &'static str {
    match err {
        AppError::Validation(_) => "validation",
        AppError::NotFound(_) => "not_found",
        AppError::Processing(_) => "training",
        AppError::Unavailable(_) | AppError::Database(_) => "unavailable",
        AppError::Io(_) => "io",
        _ => "internal",
    }
}
