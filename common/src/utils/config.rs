use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,
    #[serde(default = "default_gateway_ping_interval_secs")]
    pub gateway_ping_interval_secs: u64,
    #[serde(default = "default_gateway_poll_interval_ms")]
    pub gateway_poll_interval_ms: u64,
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,
    #[serde(default = "default_epoch_delay_ms")]
    pub epoch_delay_ms: u64,
    #[serde(default = "default_task_lease_secs")]
    pub task_lease_secs: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

fn default_http_port() -> u16 {
    8000
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_models_dir() -> String {
    "./models".to_string()
}

fn default_cors_origins() -> String {
    "http://localhost:3000,http://127.0.0.1:3000".to_string()
}

fn default_status_ttl_secs() -> u64 {
    3600
}

fn default_gateway_ping_interval_secs() -> u64 {
    10
}

fn default_gateway_poll_interval_ms() -> u64 {
    500
}

fn default_pause_poll_interval_ms() -> u64 {
    300
}

fn default_epoch_delay_ms() -> u64 {
    100
}

fn default_task_lease_secs() -> u64 {
    600
}

fn default_worker_concurrency() -> usize {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "ml_platform".to_string(),
            surrealdb_database: "jobs".to_string(),
            http_port: default_http_port(),
            data_dir: default_data_dir(),
            models_dir: default_models_dir(),
            cors_origins: default_cors_origins(),
            status_ttl_secs: default_status_ttl_secs(),
            gateway_ping_interval_secs: default_gateway_ping_interval_secs(),
            gateway_poll_interval_ms: default_gateway_poll_interval_ms(),
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            epoch_delay_ms: default_epoch_delay_ms(),
            task_lease_secs: default_task_lease_secs(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

impl AppConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn task_lease(&self) -> Duration {
        Duration::from_secs(self.task_lease_secs)
    }

    /// Allowed CORS origins, trimmed and with empty entries removed.
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = AppConfig {
            cors_origins: " http://a.test , ,http://b.test".into(),
            ..Default::default()
        };

        assert_eq!(
            config.cors_origin_list(),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.status_ttl(), Duration::from_secs(3600));
        assert_eq!(config.gateway_ping_interval_secs, 10);
        assert_eq!(config.pause_poll_interval_ms, 300);
        assert_eq!(config.worker_concurrency, 1);
    }
}
