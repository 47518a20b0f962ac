use std::sync::Arc;

use chrono::Utc;
use common::{
    error::AppError,
    jobs::{
        events::UpdateEvent,
        model_config::TaskKind,
        record::{EpochMetrics, EpochRecord, JobStatus, TrainingResult},
    },
};
use ndarray::Array1;
use state_machines::core::GuardError;
use tracing::{debug, info, instrument, warn};

use crate::{
    dataset::{prepare, train_test_split, validate_table, SplitData},
    metrics::{accuracy, classification_report, mean_absolute_error, mean_squared_error, r2_score},
    utils::round_to,
};

use super::{
    context::{Checkpoint, PipelineContext},
    state::{
        DataLoaded, DataSplit, EpochsSimulated, Finalized, ModelConfigured, ModelFitted, Ready,
        TrainingMachine,
    },
};

/// Result of a stage that can be interrupted by a cancel signal.
pub enum Flow<M> {
    Continue(M),
    Cancelled,
}

/// Pseudo-epoch count: an explicit override wins, otherwise smaller training
/// sets get more ticks.
pub fn calculate_epochs(n_train: usize, requested: Option<usize>) -> usize {
    match requested {
        Some(epochs) if epochs > 0 => epochs,
        _ if n_train < 1_000 => 50,
        _ if n_train < 10_000 => 20,
        _ => 10,
    }
}

/// Progress for epoch `epoch` of `total`, spread over 30..=80.
pub fn epoch_progress(epoch: usize, total: usize) -> u8 {
    if total == 0 {
        return 30;
    }
    let span = epoch.min(total) * 50 / total;
    30 + u8::try_from(span).unwrap_or(50)
}

/// Hold-out and training-set scores of the fitted model, in the shape the
/// dashboard charts read.
pub fn epoch_metrics(
    task: TaskKind,
    split: &SplitData,
    train_pred: &Array1<f64>,
    test_pred: &Array1<f64>,
) -> EpochMetrics {
    match task {
        TaskKind::Classification => {
            let val_accuracy = accuracy(&split.y_test, test_pred);
            let train_accuracy = accuracy(&split.y_train, train_pred);
            EpochMetrics {
                accuracy: Some(val_accuracy),
                val_accuracy: Some(val_accuracy),
                train_accuracy: Some(train_accuracy),
                loss: 1.0 - val_accuracy,
                val_loss: 1.0 - val_accuracy,
                train_loss: 1.0 - train_accuracy,
                ..Default::default()
            }
        }
        TaskKind::Regression => {
            let mse = mean_squared_error(&split.y_test, test_pred);
            EpochMetrics {
                mse: Some(mse),
                mae: Some(mean_absolute_error(&split.y_test, test_pred)),
                r2_score: Some(r2_score(&split.y_test, test_pred)),
                loss: mse,
                val_loss: mse,
                train_loss: mean_squared_error(&split.y_train, train_pred),
                ..Default::default()
            }
        }
    }
}

fn epoch_message(epoch: usize, total: usize, metrics: &EpochMetrics) -> String {
    match (metrics.val_accuracy, metrics.mse) {
        (Some(val_accuracy), _) => format!(
            "Epoch {epoch}/{total} - Val Acc: {val_accuracy:.4}, Loss: {:.4}",
            metrics.loss
        ),
        (None, mse) => format!(
            "Epoch {epoch}/{total} - MSE: {:.4}, R²: {:.4}",
            mse.unwrap_or_default(),
            metrics.r2_score.unwrap_or_default()
        ),
    }
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn load_data(
    machine: TrainingMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<TrainingMachine<(), DataLoaded>, AppError> {
    let mut table = ctx.services.load_dataset(&ctx.payload.dataset_path).await?;
    validate_table(&table, &ctx.payload.target_column)?;

    let dropped = table.drop_missing();
    if dropped > 0 {
        warn!(job_id = %ctx.job_id, dropped, "dropped rows with missing values");
    }
    if table.is_empty() {
        return Err(AppError::Validation(
            "Dataset is empty after dropping rows with missing values".to_string(),
        ));
    }

    let message = format!(
        "Dataset loaded: {} rows, {} columns",
        table.n_rows(),
        table.n_columns()
    );
    info!(job_id = %ctx.job_id, rows = table.n_rows(), columns = table.n_columns(), "dataset loaded");
    ctx.table = Some(table);
    ctx.milestone(10, message).await;

    machine
        .load()
        .map_err(|(_, guard)| map_guard_error("load", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn split_data(
    machine: TrainingMachine<(), DataLoaded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<TrainingMachine<(), DataSplit>, AppError> {
    let table = ctx.take_table()?;
    let target = ctx.payload.target_column.clone();
    let task = ctx.payload.task_type;
    let test_fraction = ctx.pipeline_config.test_fraction;
    let seed = ctx.pipeline_config.split_seed;

    let (split, class_labels) = tokio::task::spawn_blocking(move || {
        let prepared = prepare(&table, &target, task)?;
        let stratify = matches!(task, TaskKind::Classification);
        let split = train_test_split(&prepared, test_fraction, stratify, seed)?;
        Ok::<_, AppError>((split, prepared.class_labels))
    })
    .await??;

    let message = format!(
        "Data split: Train={}, Test={}",
        split.n_train(),
        split.n_test()
    );
    debug!(job_id = %ctx.job_id, classes = class_labels.len(), "data split");
    ctx.split = Some(Arc::new(split));
    ctx.class_labels = class_labels;
    ctx.milestone(20, message).await;

    machine
        .split()
        .map_err(|(_, guard)| map_guard_error("split", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn configure_model(
    machine: TrainingMachine<(), DataSplit>,
    ctx: &mut PipelineContext<'_>,
) -> Result<TrainingMachine<(), ModelConfigured>, AppError> {
    let config = ctx.payload.model()?;
    let n_train = ctx.split()?.n_train();
    ctx.total_epochs = calculate_epochs(n_train, config.epochs());

    let message = format!(
        "Model initialized: {} ({})",
        config.display_name(),
        ctx.payload.task_type.as_str()
    );
    info!(
        job_id = %ctx.job_id,
        family = config.family(),
        total_epochs = ctx.total_epochs,
        "model configured"
    );
    ctx.model_config = Some(config);
    ctx.record.total_epochs = Some(ctx.total_epochs);
    ctx.milestone(30, message).await;

    machine
        .configure()
        .map_err(|(_, guard)| map_guard_error("configure", &guard))
}

/// Fits the model on a blocking thread. The fit itself cannot be interrupted;
/// the lease is kept alive while it runs.
#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn fit_model(
    machine: TrainingMachine<(), ModelConfigured>,
    ctx: &mut PipelineContext<'_>,
) -> Result<TrainingMachine<(), ModelFitted>, AppError> {
    let config = ctx.model_config()?.clone();
    let split = ctx.split()?;
    let n_classes = ctx.class_labels.len();
    let services = ctx.services;

    let fit = services.fit_model(&config, ctx.payload.task_type, n_classes, split);
    tokio::pin!(fit);

    let mut renew = tokio::time::interval(ctx.pipeline_config.tuning.fit_lease_renew_interval);
    renew.tick().await;

    let model = loop {
        tokio::select! {
            result = &mut fit => break result?,
            _ = renew.tick() => {
                if let Err(err) = ctx.task.renew_lease(ctx.db).await {
                    warn!(task_id = %ctx.task_id, error = %err, "lease renewal during fit failed");
                }
            }
        }
    };

    debug!(job_id = %ctx.job_id, family = model.family(), "model fitted");
    ctx.model = Some(Arc::new(model));

    machine
        .fit()
        .map_err(|(_, guard)| map_guard_error("fit", &guard))
}

/// Replays the fitted model's scores once per pseudo-epoch, with a checkpoint
/// at the top of every epoch.
#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn simulate_epochs(
    machine: TrainingMachine<(), ModelFitted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<Flow<TrainingMachine<(), EpochsSimulated>>, AppError> {
    let model = ctx.model()?;
    let split = ctx.split()?;
    let eval_split = Arc::clone(&split);
    let (train_pred, test_pred) = tokio::task::spawn_blocking(move || {
        Ok::<_, AppError>((
            model.predict(&eval_split.x_train)?,
            model.predict(&eval_split.x_test)?,
        ))
    })
    .await??;

    let metrics = epoch_metrics(ctx.payload.task_type, &split, &train_pred, &test_pred);
    let total = ctx.total_epochs;

    for epoch in 1..=total {
        if ctx.checkpoint().await? == Checkpoint::Cancelled {
            return Ok(Flow::Cancelled);
        }

        let progress = epoch_progress(epoch, total);
        let message = epoch_message(epoch, total, &metrics);
        let resource_usage = ctx.services.sample_resources();
        let elapsed_time = round_to(ctx.elapsed_secs(), 2);
        ctx.history.push(EpochRecord::from_metrics(epoch, &metrics));

        ctx.record.progress = Some(progress);
        ctx.record.epoch = Some(epoch);
        ctx.record.metrics = Some(metrics.clone());
        ctx.record.elapsed_time = Some(elapsed_time);
        ctx.record.training_history = Some(ctx.history.clone());
        ctx.record.message = Some(message.clone());

        ctx.publish(&UpdateEvent::Progress {
            progress,
            epoch: Some(epoch),
            total_epochs: Some(total),
            metrics: Some(metrics.clone()),
            resource_usage: Some(resource_usage),
            elapsed_time: Some(elapsed_time),
            message,
            training_history: Some(ctx.history.clone()),
        })
        .await;
        ctx.write_status().await;

        tokio::time::sleep(ctx.pipeline_config.tuning.epoch_delay).await;
    }

    ctx.test_predictions = Some(test_pred);

    machine
        .simulate()
        .map(Flow::Continue)
        .map_err(|(_, guard)| map_guard_error("simulate", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(task_id = %ctx.task_id, job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn finalize(
    machine: TrainingMachine<(), EpochsSimulated>,
    ctx: &mut PipelineContext<'_>,
) -> Result<TrainingMachine<(), Finalized>, AppError> {
    let split = ctx.split()?;
    let model = ctx.model()?;
    let config = ctx.model_config()?.clone();
    let test_pred = ctx.test_predictions.take().ok_or_else(|| {
        AppError::InternalError("test predictions expected to be available".into())
    })?;

    let model_path = ctx.services.save_model(&ctx.job_id, &model).await?;
    info!(job_id = %ctx.job_id, %model_path, "model artifact saved");

    let task_type = ctx.payload.task_type;
    let mut result = TrainingResult {
        status: JobStatus::Completed,
        task_type,
        model_name: config.display_name().to_string(),
        accuracy: None,
        precision: None,
        recall: None,
        f1: None,
        classification_report: None,
        mse: None,
        mae: None,
        r2_score: None,
        training_time: round_to(ctx.elapsed_secs(), 2),
        training_history: ctx.history.clone(),
        model_path,
        completed_at: Utc::now(),
        job_id: ctx.job_id.clone(),
    };

    match task_type {
        TaskKind::Classification => {
            let report = classification_report(&split.y_test, &test_pred, &ctx.class_labels);
            result.accuracy = Some(report.accuracy);
            result.precision = Some(report.weighted_avg.precision);
            result.recall = Some(report.weighted_avg.recall);
            result.f1 = Some(report.weighted_avg.f1_score);
            result.classification_report = Some(report);
        }
        TaskKind::Regression => {
            result.mse = Some(mean_squared_error(&split.y_test, &test_pred));
            result.mae = Some(mean_absolute_error(&split.y_test, &test_pred));
            result.r2_score = Some(r2_score(&split.y_test, &test_pred));
        }
    }

    ctx.result = Some(result);

    machine
        .finalize()
        .map_err(|(_, guard)| map_guard_error("finalize", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid training pipeline transition during {event}: {guard:?}"
    ))
}
