use std::{sync::Arc, time::Duration};

use common::{jobs::control::JobControl, storage::db::SurrealDbClient, utils::config::AppConfig};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub jobs: Arc<JobControl>,
}

impl ApiState {
    pub async fn new(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let surreal_db_client = Arc::new(
            SurrealDbClient::new(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await?,
        );

        surreal_db_client.ensure_initialized().await?;

        Ok(Self::with_db(surreal_db_client, config))
    }

    /// Builds the state around an existing connection.
    pub fn with_db(db: Arc<SurrealDbClient>, config: &AppConfig) -> Self {
        Self {
            jobs: Arc::new(
                JobControl::new(Arc::clone(&db), config.status_ttl())
                    .with_data_dir(&config.data_dir),
            ),
            db,
            config: config.clone(),
        }
    }

    pub fn gateway_ping_interval(&self) -> Duration {
        Duration::from_secs(self.config.gateway_ping_interval_secs)
    }

    pub fn gateway_poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.gateway_poll_interval_ms)
    }
}
