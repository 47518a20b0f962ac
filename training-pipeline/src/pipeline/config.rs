use std::{path::PathBuf, time::Duration};

use common::utils::config::AppConfig;

use crate::dataset::{SPLIT_SEED, TEST_FRACTION};

#[derive(Debug, Clone)]
pub struct TrainingTuning {
    /// Pause between simulated epochs, bounding the event rate.
    pub epoch_delay: Duration,
    pub pause_poll_interval: Duration,
    pub lease_duration: Duration,
    /// How often the lease is renewed while the model is being fitted.
    pub fit_lease_renew_interval: Duration,
}

impl Default for TrainingTuning {
    fn default() -> Self {
        Self {
            epoch_delay: Duration::from_millis(100),
            pause_poll_interval: Duration::from_millis(300),
            lease_duration: Duration::from_secs(600),
            fit_lease_renew_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub tuning: TrainingTuning,
    pub models_dir: PathBuf,
    pub test_fraction: f64,
    pub split_seed: u64,
    pub status_ttl: Duration,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            tuning: TrainingTuning::default(),
            models_dir: PathBuf::from("./models"),
            test_fraction: TEST_FRACTION,
            split_seed: SPLIT_SEED,
            status_ttl: Duration::from_secs(3600),
        }
    }
}

impl TrainingConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let lease_duration = config.task_lease();
        Self {
            tuning: TrainingTuning {
                epoch_delay: Duration::from_millis(config.epoch_delay_ms),
                pause_poll_interval: Duration::from_millis(config.pause_poll_interval_ms),
                lease_duration,
                fit_lease_renew_interval: (lease_duration / 4).max(Duration::from_secs(1)),
            },
            models_dir: PathBuf::from(&config.models_dir),
            status_ttl: config.status_ttl(),
            ..Default::default()
        }
    }
}
