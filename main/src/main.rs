use api_router::{api_routes, api_state::ApiState};
use common::{
    storage::db::SurrealDbClient,
    utils::config::{get_config, AppConfig},
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use training_pipeline::{run_worker_loop, TrainingRunner};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    // One connection shared by the API and the workers, so an in-memory
    // store is visible to both.
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

    let api_state = ApiState::with_db(db.clone(), &config);
    let app = api_routes(&api_state).with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    let runner = Arc::new(TrainingRunner::new(db.clone(), &config)?);
    let mut workers = spawn_workers(&db, &runner, &config);

    tokio::select! {
        served = axum::serve(listener, app) => {
            if let Err(e) = served {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        Some(joined) = workers.join_next() => {
            match joined {
                Ok(Ok(())) => info!("Worker loop exited"),
                Ok(Err(e)) => error!("Worker loop error: {}", e),
                Err(e) => error!("Worker task panicked: {}", e),
            }
        }
    }

    workers.abort_all();
    Ok(())
}

fn spawn_workers(
    db: &Arc<SurrealDbClient>,
    runner: &Arc<TrainingRunner>,
    config: &AppConfig,
) -> JoinSet<Result<(), Box<dyn std::error::Error + Send + Sync>>> {
    let concurrency = config.worker_concurrency.max(1);
    info!(concurrency, "Starting training workers");

    let mut workers = JoinSet::new();
    for _ in 0..concurrency {
        workers.spawn(run_worker_loop(db.clone(), runner.clone()));
    }
    workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::{io::Write, time::Duration};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn smoke_test_config(models_dir: &std::path::Path) -> AppConfig {
        AppConfig {
            models_dir: models_dir.to_string_lossy().into_owned(),
            epoch_delay_ms: 1,
            pause_poll_interval_ms: 10,
            worker_concurrency: 1,
            ..AppConfig::default()
        }
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let namespace = "test_ns";
        let database = format!("test_db_{}", Uuid::new_v4());
        let db = Arc::new(
            SurrealDbClient::memory(namespace, &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("failed to initialize db");

        let models_dir = tempfile::tempdir().expect("models dir");
        let config = smoke_test_config(models_dir.path());

        let api_state = ApiState::with_db(db.clone(), &config);
        let app = api_routes(&api_state).with_state(api_state);

        let (status, _) = call(&app, Method::GET, "/live", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["db"], "ok");
    }

    #[tokio::test]
    async fn submitted_job_is_trained_by_a_worker() {
        let database = format!("test_db_{}", Uuid::new_v4());
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("failed to initialize db");

        let models_dir = tempfile::tempdir().expect("models dir");
        let config = smoke_test_config(models_dir.path());

        let mut dataset = tempfile::NamedTempFile::new().expect("dataset file");
        writeln!(dataset, "x,y,label").expect("write header");
        for i in 0..20 {
            let offset = f64::from(i) * 0.01;
            writeln!(dataset, "{},{},low", 0.1 + offset, 0.2 + offset).expect("write row");
            writeln!(dataset, "{},{},high", 5.0 + offset, 5.1 + offset).expect("write row");
        }

        let api_state = ApiState::with_db(db.clone(), &config);
        let app = api_routes(&api_state).with_state(api_state);

        let runner = Arc::new(TrainingRunner::new(db.clone(), &config).expect("runner"));
        let mut workers = spawn_workers(&db, &runner, &config);

        let (status, body) = call(
            &app,
            Method::POST,
            "/train",
            Some(json!({
                "dataset_path": dataset.path().to_string_lossy(),
                "model_config": { "model_type": "knn", "n_neighbors": 3, "epochs": 3 },
                "target_column": "label",
                "task_type": "classification"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let job_id = body["job_id"].as_str().expect("job id").to_string();

        let mut record = Value::Null;
        for _ in 0..500 {
            let (status, body) = call(&app, Method::GET, &format!("/jobs/{job_id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            record = body;
            if record["status"] == "completed" || record["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        workers.abort_all();

        assert_eq!(record["status"], "completed", "final record: {record}");
        assert_eq!(record["progress"], 100);
        assert!(record["results"]["accuracy"].as_f64().unwrap_or_default() >= 0.9);
        assert!(models_dir.path().join(format!("{job_id}_model.json")).exists());
    }
}
