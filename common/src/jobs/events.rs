use serde::{Deserialize, Serialize};

use super::record::{EpochMetrics, EpochRecord, JobStatus, TrainingResult};

/// Host utilization at the time of a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUsage {
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    /// Percent across all cores.
    pub cpu: f64,
    /// Gigabytes in use.
    pub ram: f64,
    /// Percent of the first GPU, 0 when none is available.
    pub gpu: f64,
}

/// Transient message relayed to live listeners of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpdateEvent {
    Connected {
        job_id: String,
        message: String,
    },
    Status {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        job_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        progress: Option<u8>,
        message: String,
    },
    Progress {
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        epoch: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        total_epochs: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        metrics: Option<EpochMetrics>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        resource_usage: Option<ResourceUsage>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        elapsed_time: Option<f64>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        training_history: Option<Vec<EpochRecord>>,
    },
    Complete {
        progress: u8,
        elapsed_time: f64,
        results: Box<TrainingResult>,
        message: String,
    },
    Error {
        error: String,
        message: String,
    },
    Ping {
        timestamp: String,
    },
}

impl UpdateEvent {
    pub fn status(status: JobStatus, message: impl Into<String>) -> Self {
        UpdateEvent::Status {
            status,
            job_id: None,
            progress: None,
            message: message.into(),
        }
    }

    /// Simple milestone update without epoch details.
    pub fn milestone(progress: u8, message: impl Into<String>) -> Self {
        UpdateEvent::Progress {
            progress,
            epoch: None,
            total_epochs: None,
            metrics: None,
            resource_usage: None,
            elapsed_time: None,
            message: message.into(),
            training_history: None,
        }
    }

    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        UpdateEvent::Error {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn ping() -> Self {
        UpdateEvent::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateEvent::Connected { .. } => "connected",
            UpdateEvent::Status { .. } => "status",
            UpdateEvent::Progress { .. } => "progress",
            UpdateEvent::Complete { .. } => "complete",
            UpdateEvent::Error { .. } => "error",
            UpdateEvent::Ping { .. } => "ping",
        }
    }
}
