use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::get_config};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use training_pipeline::{run_worker_loop, TrainingRunner};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    tokio::fs::create_dir_all(&config.models_dir).await?;
    let runner = Arc::new(TrainingRunner::new(db.clone(), &config)?);

    let concurrency = config.worker_concurrency.max(1);
    info!(concurrency, models_dir = %config.models_dir, "Starting training workers");

    let mut workers = JoinSet::new();
    for _ in 0..concurrency {
        workers.spawn(run_worker_loop(db.clone(), runner.clone()));
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Worker loop error: {}", e),
            Err(e) => error!("Worker task panicked: {}", e),
        }
    }

    Ok(())
}
