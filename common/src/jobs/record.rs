use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_machines::state_machine;

use crate::error::AppError;

use super::model_config::TaskKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Accepted,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_tag(tag: &str) -> Option<JobStatus> {
        match tag {
            "accepted" => Some(JobStatus::Accepted),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Validates a status change against the job lifecycle and returns the
    /// resulting status.
    pub fn transition(&self, event: JobTransition) -> Result<JobStatus, AppError> {
        compute_next_status(self, event)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    StartRunning,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::StartRunning => "start_running",
            JobTransition::Pause => "pause",
            JobTransition::Resume => "resume",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
            JobTransition::Cancel => "cancel",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Accepted,
        states: [Accepted, Running, Paused, Completed, Failed, Cancelled],
        events {
            start_running {
                transition: { from: Accepted, to: Running }
            }
            pause {
                transition: { from: Running, to: Paused }
            }
            resume {
                transition: { from: Paused, to: Running }
            }
            complete {
                transition: { from: Running, to: Completed }
            }
            fail {
                transition: { from: Accepted, to: Failed }
                transition: { from: Running, to: Failed }
                transition: { from: Paused, to: Failed }
            }
            cancel {
                transition: { from: Accepted, to: Cancelled }
                transition: { from: Running, to: Cancelled }
                transition: { from: Paused, to: Cancelled }
            }
        }
    }

    pub(super) fn accepted() -> JobLifecycleMachine<(), Accepted> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn running() -> JobLifecycleMachine<(), Running> {
        accepted()
            .start_running()
            .expect("start_running transition from Accepted should exist")
    }

    pub(super) fn paused() -> JobLifecycleMachine<(), Paused> {
        running()
            .pause()
            .expect("pause transition from Running should exist")
    }
}

fn invalid_transition(status: &JobStatus, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(status: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (status, event) {
        (JobStatus::Accepted, JobTransition::StartRunning) => accepted()
            .start_running()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Pause) => running()
            .pause()
            .map(|_| JobStatus::Paused)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Paused, JobTransition::Resume) => paused()
            .resume()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Complete) => running()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Accepted, JobTransition::Fail) => accepted()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Fail) => running()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Paused, JobTransition::Fail) => paused()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Accepted, JobTransition::Cancel) => accepted()
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Cancel) => running()
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Paused, JobTransition::Cancel) => paused()
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(status, event)),
        _ => Err(invalid_transition(status, event)),
    }
}

/// Metrics reported for one simulated epoch. Keys follow the camelCase names
/// the dashboard charts read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EpochMetrics {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accuracy: Option<f64>,
    #[serde(rename = "valAccuracy", skip_serializing_if = "Option::is_none", default)]
    pub val_accuracy: Option<f64>,
    #[serde(rename = "trainAccuracy", skip_serializing_if = "Option::is_none", default)]
    pub train_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mse: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mae: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub r2_score: Option<f64>,
    pub loss: f64,
    #[serde(rename = "valLoss")]
    pub val_loss: f64,
    #[serde(rename = "trainLoss")]
    pub train_loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochRecord {
    /// 1-based.
    pub epoch: usize,
    #[serde(rename = "trainLoss")]
    pub train_loss: f64,
    #[serde(rename = "valLoss")]
    pub val_loss: f64,
    #[serde(rename = "trainAccuracy", skip_serializing_if = "Option::is_none", default)]
    pub train_accuracy: Option<f64>,
    #[serde(rename = "valAccuracy", skip_serializing_if = "Option::is_none", default)]
    pub val_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mse: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub r2: Option<f64>,
}

impl EpochRecord {
    pub fn from_metrics(epoch: usize, metrics: &EpochMetrics) -> Self {
        Self {
            epoch,
            train_loss: metrics.train_loss,
            val_loss: metrics.val_loss,
            train_accuracy: metrics.train_accuracy,
            val_accuracy: metrics.val_accuracy,
            mse: metrics.mse,
            r2: metrics.r2_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassScores {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AverageScores {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// Per-class hold-out scores plus the confusion matrix (rows are true
/// labels, columns predictions, both in `labels` order).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationReport {
    pub labels: Vec<String>,
    pub classes: Vec<ClassScores>,
    pub accuracy: f64,
    pub macro_avg: AverageScores,
    pub weighted_avg: AverageScores,
    pub confusion_matrix: Vec<Vec<usize>>,
}

/// Final hold-out evaluation of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingResult {
    pub status: JobStatus,
    pub task_type: TaskKind,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub precision: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recall: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub f1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub classification_report: Option<ClassificationReport>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mse: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mae: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub r2_score: Option<f64>,
    /// Seconds, rounded to two decimals.
    pub training_time: f64,
    pub training_history: Vec<EpochRecord>,
    pub model_path: String,
    pub completed_at: DateTime<Utc>,
    pub job_id: String,
}

/// Persisted snapshot of a job. Only `job_id` and `status` are always present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dataset_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_type: Option<TaskKind>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub epoch: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metrics: Option<EpochMetrics>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub elapsed_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub training_history: Option<Vec<EpochRecord>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub results: Option<TrainingResult>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl JobStatusRecord {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            task_id: None,
            created_at: None,
            dataset_path: None,
            model_config: None,
            target_column: None,
            task_type: None,
            progress: None,
            epoch: None,
            total_epochs: None,
            metrics: None,
            elapsed_time: None,
            training_history: None,
            results: None,
            model_path: None,
            error: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_transition_table() {
        let running = JobStatus::Accepted
            .transition(JobTransition::StartRunning)
            .expect("start");
        assert_eq!(running, JobStatus::Running);

        let paused = running.transition(JobTransition::Pause).expect("pause");
        assert_eq!(paused, JobStatus::Paused);
        assert_eq!(
            paused.transition(JobTransition::Resume).expect("resume"),
            JobStatus::Running
        );
        assert_eq!(
            paused.transition(JobTransition::Cancel).expect("cancel"),
            JobStatus::Cancelled
        );
        assert_eq!(
            running.transition(JobTransition::Complete).expect("complete"),
            JobStatus::Completed
        );
        assert_eq!(
            JobStatus::Accepted
                .transition(JobTransition::Fail)
                .expect("fail early"),
            JobStatus::Failed
        );
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let events = [
            JobTransition::StartRunning,
            JobTransition::Pause,
            JobTransition::Resume,
            JobTransition::Complete,
            JobTransition::Fail,
            JobTransition::Cancel,
        ];

        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(status.is_terminal());
            for event in events {
                assert!(
                    status.transition(event).is_err(),
                    "{status} should reject {event:?}"
                );
            }
        }
    }

    #[test]
    fn invalid_transitions_are_validation_errors() {
        let err = JobStatus::Accepted
            .transition(JobTransition::Pause)
            .expect_err("cannot pause before running");
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("accepted -> pause")));

        assert!(JobStatus::Paused
            .transition(JobTransition::Complete)
            .is_err());
    }

    #[test]
    fn record_serializes_camel_case_metrics_and_skips_absent_fields() {
        let mut record = JobStatusRecord::new("job_1", JobStatus::Running);
        record.metrics = Some(EpochMetrics {
            accuracy: Some(0.9),
            val_accuracy: Some(0.9),
            train_accuracy: Some(1.0),
            loss: 0.1,
            val_loss: 0.1,
            train_loss: 0.0,
            ..Default::default()
        });

        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["status"], "running");
        assert_eq!(json["metrics"]["valAccuracy"], 0.9);
        assert!(json.get("error").is_none());
        assert!(json["metrics"].get("mse").is_none());

        let back: JobStatusRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, record);
    }
}
