use api_state::ApiState;
use axum::{
    extract::FromRef,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use routes::{
    gateway::job_updates,
    jobs::{get_job, pause_job, resume_job, stop_job},
    probes::{live, ready},
    training::train,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

pub mod api_state;
pub mod error;
pub mod routes;

/// Router for the job API and the live update gateway.
pub fn api_routes<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Probes for k8s/systemd
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let jobs = Router::new()
        .route("/train", post(train))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/pause", post(pause_job))
        .route("/jobs/{job_id}/resume", post(resume_job))
        .route("/jobs/{job_id}/stop", post(stop_job))
        .route("/ws/{job_id}", get(job_updates));

    public
        .merge(jobs)
        .layer(cors_layer(&app_state.config.cors_origin_list()))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%origin, error = %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
    };
    use common::{
        jobs::record::{JobStatus, JobStatusRecord},
        storage::db::SurrealDbClient,
        utils::config::AppConfig,
    };
    use serde_json::{json, Value};
    use std::{io::Write, sync::Arc};
    use tempfile::NamedTempFile;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn app() -> (Router, ApiState) {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("in-memory surrealdb");
        let state = ApiState::with_db(Arc::new(db), &AppConfig::default());
        let router = api_routes(&state).with_state(state.clone());
        (router, state)
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
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
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn dataset() -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "a,b,label\n1,2,x\n3,4,y").expect("write csv");
        file
    }

    #[tokio::test]
    async fn probes_report_ok() {
        let (router, _) = app().await;
        let (status, body) = send(&router, Method::GET, "/live", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&router, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["db"], "ok");
    }

    #[tokio::test]
    async fn readiness_fails_when_store_is_unreachable() {
        let state = ApiState::with_db(
            Arc::new(SurrealDbClient::disconnected()),
            &AppConfig::default(),
        );
        let router = api_routes(&state).with_state(state);

        let (status, body) = send(&router, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn train_then_read_status() {
        let (router, _) = app().await;
        let file = dataset();
        let path = file.path().to_string_lossy().to_string();

        let (status, body) = send(
            &router,
            Method::POST,
            "/train",
            Some(json!({
                "dataset_path": path,
                "model_config": { "model_type": "knn", "n_neighbors": 3 },
                "target_column": "label",
                "task_type": "classification"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["message"], "Training job created successfully");
        let job_id = body["job_id"].as_str().expect("job id").to_string();
        assert!(body["task_id"].is_string());

        let (status, record) = send(&router, Method::GET, &format!("/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["job_id"], job_id.as_str());
        assert_eq!(record["status"], "accepted");
        assert_eq!(record["target_column"], "label");
    }

    #[tokio::test]
    async fn train_with_missing_dataset_is_not_found() {
        let (router, _) = app().await;
        let (status, body) = send(
            &router,
            Method::POST,
            "/train",
            Some(json!({
                "dataset_path": "/no/such/file.csv",
                "model_config": { "model_type": "svm" },
                "target_column": "label"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
        assert!(body["error"]
            .as_str()
            .is_some_and(|e| e.contains("/no/such/file.csv")));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (router, _) = app().await;
        let (status, body) = send(&router, Method::GET, "/jobs/job_404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Job not found: job_404");

        let (status, _) = send(&router, Method::POST, "/jobs/job_404/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_resume_and_stop_follow_the_lifecycle() {
        let (router, state) = app().await;
        let record = JobStatusRecord::new("job_live", JobStatus::Running);
        assert!(state
            .jobs
            .store()
            .try_write_status(&record)
            .await
            .expect("write"));

        let (status, body) = send(&router, Method::POST, "/jobs/job_live/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "paused");

        let (status, body) = send(&router, Method::POST, "/jobs/job_live/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, body) = send(&router, Method::POST, "/jobs/job_live/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, body) = send(&router, Method::POST, "/jobs/job_live/pause", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .is_some_and(|e| e.contains("Cannot pause job")));

        let (status, record) = send(&router, Method::GET, "/jobs/job_live", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "cancelled");
    }

    #[tokio::test]
    async fn stopping_a_finished_job_is_rejected() {
        let (router, state) = app().await;
        let record = JobStatusRecord::new("job_done", JobStatus::Completed);
        assert!(state
            .jobs
            .store()
            .try_write_status(&record)
            .await
            .expect("write"));

        let (status, _) = send(&router, Method::POST, "/jobs/job_done/stop", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
