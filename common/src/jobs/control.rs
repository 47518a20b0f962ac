use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{training_payload::TrainingPayload, training_task::TrainingTask},
    },
};

use super::{
    events::UpdateEvent,
    model_config::{ModelConfig, TaskKind},
    record::{JobStatus, JobStatusRecord, JobTransition},
    state_store::JobStateStore,
    update_channel::UpdateChannel,
};

fn default_task_type() -> TaskKind {
    TaskKind::Classification
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateJobRequest {
    pub dataset_path: String,
    pub model_config: Value,
    pub target_column: String,
    #[serde(default = "default_task_type")]
    pub task_type: TaskKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSubmission {
    pub job_id: String,
    pub status: JobStatus,
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobCommandResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// Entry points that turn client commands into store, channel and queue
/// operations. Holds no per-job state of its own.
pub struct JobControl {
    db: Arc<SurrealDbClient>,
    store: JobStateStore,
    channel: UpdateChannel,
    last_id_millis: AtomicU64,
    /// Base directory for relative dataset paths.
    data_dir: Option<PathBuf>,
}

fn unavailable(context: &str) -> impl FnOnce(AppError) -> AppError + '_ {
    move |err| match err {
        AppError::Unavailable(_) => err,
        other => AppError::Unavailable(format!("{context}: {other}")),
    }
}

impl JobControl {
    pub fn new(db: Arc<SurrealDbClient>, status_ttl: Duration) -> Self {
        Self {
            store: JobStateStore::new(db.clone(), status_ttl),
            channel: UpdateChannel::new(db.clone()),
            db,
            last_id_millis: AtomicU64::new(0),
            data_dir: None,
        }
    }

    /// Resolves relative dataset paths against `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    fn resolve_dataset_path(&self, raw: &str) -> String {
        match &self.data_dir {
            Some(dir) if Path::new(raw).is_relative() => {
                dir.join(raw).to_string_lossy().into_owned()
            }
            _ => raw.to_string(),
        }
    }

    /// Status a finished job holds when one of our writes was refused, or
    /// `None` when the refusal came from anything else.
    async fn finished_status(&self, job_id: &str) -> Option<JobStatus> {
        match self.store.read_status(job_id).await {
            Ok(Some(record)) if record.status.is_terminal() => Some(record.status),
            _ => None,
        }
    }

    pub fn store(&self) -> &JobStateStore {
        &self.store
    }

    pub fn channel(&self) -> &UpdateChannel {
        &self.channel
    }

    /// `job_<millis>`, strictly increasing within this process even when two
    /// jobs are created in the same millisecond.
    pub fn next_job_id(&self) -> String {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let mut previous = self.last_id_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(previous + 1);
            match self.last_id_millis.compare_exchange_weak(
                previous,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("job_{candidate}"),
                Err(actual) => previous = actual,
            }
        }
    }

    #[instrument(skip_all, fields(dataset_path = %request.dataset_path, task_type = request.task_type.as_str()))]
    pub async fn create_job(&self, mut request: CreateJobRequest) -> Result<JobSubmission, AppError> {
        request.dataset_path = self.resolve_dataset_path(&request.dataset_path);
        match tokio::fs::metadata(&request.dataset_path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(AppError::NotFound(format!(
                    "Dataset file not found: {}",
                    request.dataset_path
                )))
            }
        }
        ModelConfig::from_value(&request.model_config)?;
        if request.target_column.trim().is_empty() {
            return Err(AppError::Validation(
                "target_column must not be empty".to_string(),
            ));
        }

        let job_id = self.next_job_id();
        let task = TrainingTask::new(TrainingPayload {
            job_id: job_id.clone(),
            dataset_path: request.dataset_path.clone(),
            model_config: request.model_config.clone(),
            target_column: request.target_column.clone(),
            task_type: request.task_type,
        });

        let mut record = JobStatusRecord::new(&job_id, JobStatus::Accepted);
        record.task_id = Some(task.id.clone());
        record.created_at = Some(Utc::now());
        record.dataset_path = Some(request.dataset_path);
        record.model_config = Some(request.model_config);
        record.target_column = Some(request.target_column);
        record.task_type = Some(request.task_type);
        self.store.write_status(&record).await;

        let task = match task.enqueue(&self.db).await {
            Ok(task) => task,
            Err(err) => {
                error!(%job_id, error = %err, "failed to submit training task");
                let mut failed = record.clone();
                failed.status = record.status.transition(JobTransition::Fail)?;
                failed.error = Some(format!("Failed to submit training task: {err}"));
                self.store.write_status(&failed).await;
                return Err(AppError::Unavailable(format!(
                    "Failed to submit training task: {err}"
                )));
            }
        };

        info!(%job_id, task_id = %task.id, "training job accepted");

        Ok(JobSubmission {
            job_id,
            status: JobStatus::Accepted,
            task_id: task.id,
            message: "Training job created successfully".to_string(),
        })
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusRecord, AppError> {
        self.store
            .read_status(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job not found: {job_id}")))
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, job_id: &str) -> Result<JobCommandResponse, AppError> {
        let record = self.get_status(job_id).await?;
        self.pause_from(job_id, record).await
    }

    async fn pause_from(
        &self,
        job_id: &str,
        mut record: JobStatusRecord,
    ) -> Result<JobCommandResponse, AppError> {
        match record.status {
            JobStatus::Paused => {}
            JobStatus::Running => {
                record.status.transition(JobTransition::Pause)?;
            }
            other => {
                return Err(AppError::Validation(format!(
                    "Cannot pause job. Current status: {other}"
                )))
            }
        }

        self.store
            .set_pause(job_id)
            .await
            .map_err(unavailable("Failed to set pause flag"))?;

        record.status = JobStatus::Paused;
        record.message = Some("Training paused by user".to_string());
        if self.store.write_status(&record).await {
            self.channel
                .publish(
                    job_id,
                    &UpdateEvent::status(
                        JobStatus::Paused,
                        "Training paused. Click Resume to continue.",
                    ),
                )
                .await;
        } else if let Some(finished) = self.finished_status(job_id).await {
            if let Err(err) = self.store.clear_pause(job_id).await {
                warn!(%job_id, error = %err, "failed to clear pause flag");
            }
            return Err(AppError::Validation(format!(
                "Cannot pause job. Current status: {finished}"
            )));
        }

        Ok(JobCommandResponse {
            job_id: job_id.to_string(),
            status: JobStatus::Paused,
            message: "Job paused successfully".to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, job_id: &str) -> Result<JobCommandResponse, AppError> {
        let record = self.get_status(job_id).await?;
        self.resume_from(job_id, record).await
    }

    async fn resume_from(
        &self,
        job_id: &str,
        mut record: JobStatusRecord,
    ) -> Result<JobCommandResponse, AppError> {
        match record.status {
            JobStatus::Running => {}
            JobStatus::Paused => {
                record.status.transition(JobTransition::Resume)?;
            }
            other => {
                return Err(AppError::Validation(format!(
                    "Cannot resume job. Current status: {other}"
                )))
            }
        }

        self.store
            .clear_pause(job_id)
            .await
            .map_err(unavailable("Failed to clear pause flag"))?;

        record.status = JobStatus::Running;
        record.message = Some("Training resumed".to_string());
        if self.store.write_status(&record).await {
            self.channel
                .publish(
                    job_id,
                    &UpdateEvent::status(JobStatus::Running, "Training resumed"),
                )
                .await;
        } else if let Some(finished) = self.finished_status(job_id).await {
            return Err(AppError::Validation(format!(
                "Cannot resume job. Current status: {finished}"
            )));
        }

        Ok(JobCommandResponse {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            message: "Job resumed successfully".to_string(),
        })
    }

    /// Records the job as cancelled and revokes the queued task. A running
    /// worker stops at its next checkpoint.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<JobCommandResponse, AppError> {
        let record = self.get_status(job_id).await?;
        self.cancel_from(job_id, record).await
    }

    async fn cancel_from(
        &self,
        job_id: &str,
        mut record: JobStatusRecord,
    ) -> Result<JobCommandResponse, AppError> {
        if record.status != JobStatus::Cancelled {
            record.status.transition(JobTransition::Cancel).map_err(|_| {
                AppError::Validation(format!(
                    "Cannot stop job. Current status: {}",
                    record.status
                ))
            })?;
        }

        self.store
            .set_cancel(job_id)
            .await
            .map_err(unavailable("Failed to set cancel flag"))?;

        // The cancelled record goes in before the task is revoked, so a job
        // that finished in the meantime keeps its own outcome.
        record.status = JobStatus::Cancelled;
        record.message = Some("Training cancelled by user".to_string());
        if !self.store.write_status_durable(&record).await {
            if let Some(finished) = self
                .finished_status(job_id)
                .await
                .filter(|status| *status != JobStatus::Cancelled)
            {
                if let Err(err) = self.store.clear_signals(job_id).await {
                    warn!(%job_id, error = %err, "failed to clear job signals");
                }
                return Err(AppError::Validation(format!(
                    "Cannot stop job. Current status: {finished}"
                )));
            }
            warn!(%job_id, "cancelled status was not recorded");
        }

        if let Some(task_id) = &record.task_id {
            match TrainingTask::revoke(&self.db, task_id)
                .await
                .map_err(unavailable("Failed to revoke training task"))?
            {
                Some(_) => info!(%job_id, %task_id, "training task revoked"),
                None => warn!(%job_id, %task_id, "training task already finished or unknown"),
            }
        }

        if let Err(err) = self.store.clear_pause(job_id).await {
            warn!(%job_id, error = %err, "failed to clear pause flag");
        }

        self.channel
            .publish(
                job_id,
                &UpdateEvent::error("Cancelled", "Training cancelled by user"),
            )
            .await;

        Ok(JobCommandResponse {
            job_id: job_id.to_string(),
            status: JobStatus::Cancelled,
            message: "Job stopped successfully".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{training_task::TaskState, StoredObject};
    use serde_json::json;
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    async fn control() -> JobControl {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("in-memory surrealdb");
        JobControl::new(Arc::new(db), Duration::from_secs(3600))
    }

    fn dataset() -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "a,b,label\n1,2,x\n3,4,y").expect("write csv");
        file
    }

    fn request(path: &str) -> CreateJobRequest {
        CreateJobRequest {
            dataset_path: path.to_string(),
            model_config: json!({ "model_type": "random_forest", "n_estimators": 5 }),
            target_column: "label".to_string(),
            task_type: TaskKind::Classification,
        }
    }

    async fn queued_tasks(control: &JobControl) -> Vec<TrainingTask> {
        control
            .db
            .handle()
            .select(TrainingTask::table_name())
            .await
            .expect("select tasks")
    }

    async fn force_status(control: &JobControl, job_id: &str, status: JobStatus) {
        let mut record = control.get_status(job_id).await.expect("status");
        record.status = status;
        assert!(control.store.try_write_status(&record).await.expect("write"));
    }

    #[tokio::test]
    async fn job_ids_are_unique_and_increasing() {
        let db = Arc::new(SurrealDbClient::disconnected());
        let control = JobControl::new(db, Duration::from_secs(1));

        let ids: Vec<u64> = (0..500)
            .map(|_| {
                control
                    .next_job_id()
                    .trim_start_matches("job_")
                    .parse()
                    .expect("numeric suffix")
            })
            .collect();

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    }

    #[tokio::test]
    async fn create_job_writes_accepted_record_and_enqueues_task() {
        let control = control().await;
        let file = dataset();
        let path = file.path().to_string_lossy().to_string();

        let submission = control.create_job(request(&path)).await.expect("create");
        assert_eq!(submission.status, JobStatus::Accepted);
        assert!(submission.job_id.starts_with("job_"));
        assert_eq!(submission.message, "Training job created successfully");

        let record = control.get_status(&submission.job_id).await.expect("status");
        assert_eq!(record.status, JobStatus::Accepted);
        assert_eq!(record.task_id.as_deref(), Some(submission.task_id.as_str()));
        assert_eq!(record.dataset_path.as_deref(), Some(path.as_str()));
        assert_eq!(record.target_column.as_deref(), Some("label"));

        let tasks = queued_tasks(&control).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, submission.task_id);
        assert_eq!(tasks[0].state, TaskState::Pending);
        assert_eq!(tasks[0].content.job_id, submission.job_id);
    }

    #[tokio::test]
    async fn missing_dataset_never_reaches_the_queue() {
        let control = control().await;

        let err = control
            .create_job(request("/definitely/not/here.csv"))
            .await
            .expect_err("missing dataset");
        assert!(matches!(err, AppError::NotFound(msg) if msg.contains("/definitely/not/here.csv")));

        assert!(queued_tasks(&control).await.is_empty());
        let records: Vec<crate::storage::types::job_status_entry::JobStatusEntry> = control
            .db
            .handle()
            .select("job_status")
            .await
            .expect("select status");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn invalid_model_config_is_rejected() {
        let control = control().await;
        let file = dataset();
        let mut req = request(&file.path().to_string_lossy());
        req.model_config = json!({ "model_type": "gradient_boosting" });

        let err = control.create_job(req).await.expect_err("bad config");
        assert!(matches!(err, AppError::Validation(_)));
        assert!(queued_tasks(&control).await.is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume_follow_status_rules() {
        let control = control().await;
        let file = dataset();
        let submission = control
            .create_job(request(&file.path().to_string_lossy()))
            .await
            .expect("create");
        let job_id = submission.job_id.as_str();

        let err = control.pause(job_id).await.expect_err("accepted is not pausable");
        assert!(matches!(err, AppError::Validation(msg) if msg == "Cannot pause job. Current status: accepted"));

        force_status(&control, job_id, JobStatus::Running).await;
        let paused = control.pause(job_id).await.expect("pause");
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(control.store.read_signals(job_id).await.expect("signals").paused);
        assert_eq!(
            control.get_status(job_id).await.expect("status").status,
            JobStatus::Paused
        );

        // Re-pausing is idempotent
        control.pause(job_id).await.expect("pause again");

        let resumed = control.resume(job_id).await.expect("resume");
        assert_eq!(resumed.status, JobStatus::Running);
        assert!(!control.store.read_signals(job_id).await.expect("signals").paused);
        assert_eq!(
            control.get_status(job_id).await.expect("status").status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn cancel_before_pickup_revokes_the_task() {
        let control = control().await;
        let file = dataset();
        let submission = control
            .create_job(request(&file.path().to_string_lossy()))
            .await
            .expect("create");

        let response = control.cancel(&submission.job_id).await.expect("cancel");
        assert_eq!(response.status, JobStatus::Cancelled);

        let record = control.get_status(&submission.job_id).await.expect("status");
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.message.as_deref(), Some("Training cancelled by user"));

        let tasks = queued_tasks(&control).await;
        assert_eq!(tasks[0].state, TaskState::Cancelled);
        assert!(tasks[0].revoked);

        // Stopping again is harmless, resuming is not allowed
        control.cancel(&submission.job_id).await.expect("cancel again");
        assert!(control.resume(&submission.job_id).await.is_err());
    }

    #[tokio::test]
    async fn finished_job_cannot_be_stopped() {
        let control = control().await;
        let file = dataset();
        let submission = control
            .create_job(request(&file.path().to_string_lossy()))
            .await
            .expect("create");
        force_status(&control, &submission.job_id, JobStatus::Completed).await;

        let err = control.cancel(&submission.job_id).await.expect_err("terminal");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn relative_dataset_paths_resolve_against_the_data_dir() {
        let data_dir = tempfile::tempdir().expect("data dir");
        std::fs::write(data_dir.path().join("iris.csv"), "a,b,label\n1,2,x\n")
            .expect("write csv");
        let control = control().await.with_data_dir(data_dir.path());

        let submission = control.create_job(request("iris.csv")).await.expect("create");

        let expected = data_dir.path().join("iris.csv").to_string_lossy().into_owned();
        let record = control.get_status(&submission.job_id).await.expect("status");
        assert_eq!(record.dataset_path.as_deref(), Some(expected.as_str()));
        let tasks = queued_tasks(&control).await;
        assert_eq!(tasks[0].content.dataset_path, expected);

        // Absolute paths are taken as given
        let file = dataset();
        let absolute = file.path().to_string_lossy().to_string();
        let submission = control.create_job(request(&absolute)).await.expect("create");
        let record = control.get_status(&submission.job_id).await.expect("status");
        assert_eq!(record.dataset_path.as_deref(), Some(absolute.as_str()));
    }

    #[tokio::test]
    async fn pause_after_completion_is_refused_and_not_announced() {
        let control = control().await;
        let file = dataset();
        let submission = control
            .create_job(request(&file.path().to_string_lossy()))
            .await
            .expect("create");
        let job_id = submission.job_id.as_str();

        force_status(&control, job_id, JobStatus::Running).await;
        let running = control.get_status(job_id).await.expect("status");
        force_status(&control, job_id, JobStatus::Completed).await;

        let mut subscription = control.channel.subscribe(job_id).await.expect("subscribe");
        let err = control
            .pause_from(job_id, running.clone())
            .await
            .expect_err("job already completed");
        assert!(matches!(err, AppError::Validation(msg) if msg == "Cannot pause job. Current status: completed"));

        let err = control
            .resume_from(job_id, running)
            .await
            .expect_err("job already completed");
        assert!(matches!(err, AppError::Validation(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(subscription.try_next().expect("open channel"), None);
        assert_eq!(
            control.get_status(job_id).await.expect("status").status,
            JobStatus::Completed
        );
        assert!(!control.store.read_signals(job_id).await.expect("signals").paused);
    }

    #[tokio::test]
    async fn cancel_racing_a_completion_keeps_the_completed_outcome() {
        let control = control().await;
        let file = dataset();
        let submission = control
            .create_job(request(&file.path().to_string_lossy()))
            .await
            .expect("create");
        let job_id = submission.job_id.as_str();

        force_status(&control, job_id, JobStatus::Running).await;
        let running = control.get_status(job_id).await.expect("status");
        force_status(&control, job_id, JobStatus::Completed).await;

        let mut subscription = control.channel.subscribe(job_id).await.expect("subscribe");
        let err = control
            .cancel_from(job_id, running)
            .await
            .expect_err("job already completed");
        assert!(matches!(err, AppError::Validation(msg) if msg == "Cannot stop job. Current status: completed"));

        assert_eq!(
            control.get_status(job_id).await.expect("status").status,
            JobStatus::Completed
        );
        let tasks = queued_tasks(&control).await;
        assert!(!tasks[0].revoked);
        let signals = control.store.read_signals(job_id).await.expect("signals");
        assert!(!signals.cancel_requested);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(subscription.try_next().expect("open channel"), None);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found_and_unreachable_store_is_unavailable() {
        let control = control().await;
        assert!(matches!(
            control.get_status("job_0").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(control.pause("job_0").await, Err(AppError::NotFound(_))));

        let offline = JobControl::new(
            Arc::new(SurrealDbClient::disconnected()),
            Duration::from_secs(3600),
        );
        assert!(matches!(
            offline.get_status("job_0").await,
            Err(AppError::Unavailable(_))
        ));
    }
}
