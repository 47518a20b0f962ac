#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod dataset;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod utils;

use chrono::Utc;
use common::storage::{db::SurrealDbClient, types::training_task::TrainingTask};
pub use pipeline::{RunOutcome, TrainingConfig, TrainingRunner, TrainingTuning};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often an idle worker sweeps expired job status records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    runner: Arc<TrainingRunner>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let worker_id = format!("training-worker-{}", Uuid::new_v4());
    let lease_duration = runner.config().tuning.lease_duration;
    let idle_backoff = Duration::from_millis(500);
    let mut last_purge: Option<Instant> = None;

    loop {
        match TrainingTask::claim_next_ready(&db, &worker_id, Utc::now(), lease_duration).await {
            Ok(Some(task)) => {
                let task_id = task.id.clone();
                info!(
                    %worker_id,
                    %task_id,
                    job_id = %task.content.job_id,
                    attempt = task.attempts,
                    "claimed training task"
                );
                match runner.process_task(task).await {
                    Ok(outcome) => debug!(%worker_id, %task_id, ?outcome, "training task finished"),
                    Err(err) => error!(%worker_id, %task_id, error = %err, "training task failed"),
                }
            }
            Ok(None) => {
                if last_purge.map_or(true, |at| at.elapsed() >= PURGE_INTERVAL) {
                    match runner.store().purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => info!(%worker_id, removed, "purged expired job statuses"),
                        Err(err) => warn!(%worker_id, error = %err, "failed to purge job statuses"),
                    }
                    last_purge = Some(Instant::now());
                }
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim training task");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
