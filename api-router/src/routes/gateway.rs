use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use common::{
    error::AppError,
    jobs::{control::JobControl, events::UpdateEvent},
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::api_state::ApiState;

#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    /// Idle time after which a keep-alive ping is sent.
    pub ping_interval: Duration,
    pub poll_interval: Duration,
}

pub async fn job_updates(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, job_id))
}

async fn handle_socket(socket: WebSocket, state: ApiState, job_id: String) {
    let settings = GatewaySettings {
        ping_interval: state.gateway_ping_interval(),
        poll_interval: state.gateway_poll_interval(),
    };
    let (mut sender, mut receiver) = socket.split();

    let client_gone = async {
        while let Some(message) = receiver.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    };

    tokio::select! {
        () = run_gateway(&mut sender, &state.jobs, &job_id, &settings) => {}
        () = client_gone => debug!(%job_id, "client closed live update connection"),
    }
}

async fn send_text<S>(sink: &mut S, job_id: &str, text: String) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match sink.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(err) => {
            debug!(%job_id, error = %err, "live update send failed");
            false
        }
    }
}

async fn send_event<S>(sink: &mut S, job_id: &str, event: &UpdateEvent) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match serde_json::to_string(event) {
        Ok(text) => send_text(sink, job_id, text).await,
        Err(err) => {
            warn!(%job_id, error = %err, "failed to serialize live update");
            true
        }
    }
}

async fn close<S>(sink: &mut S)
where
    S: Sink<Message> + Unpin,
{
    let _ = sink.send(Message::Close(None)).await;
}

/// Bridges one connection to the update channel of `job_id` until a send
/// fails or the channel breaks. Ends with a close frame.
pub async fn run_gateway<S>(
    sink: &mut S,
    jobs: &JobControl,
    job_id: &str,
    settings: &GatewaySettings,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let connected = UpdateEvent::Connected {
        job_id: job_id.to_string(),
        message: format!("Connected to job {job_id}"),
    };
    if !send_event(sink, job_id, &connected).await {
        return;
    }

    let mut subscription = match jobs.channel().subscribe(job_id).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(%job_id, error = %err, "update channel unavailable");
            send_event(
                sink,
                job_id,
                &UpdateEvent::error(
                    "Update channel unavailable",
                    format!("Live updates are unavailable: {err}"),
                ),
            )
            .await;
            close(sink).await;
            return;
        }
    };

    match jobs.get_status(job_id).await {
        Ok(record) => {
            let current = UpdateEvent::Status {
                status: record.status,
                job_id: Some(job_id.to_string()),
                progress: record.progress,
                message: record
                    .message
                    .unwrap_or_else(|| format!("Current status: {}", record.status)),
            };
            if !send_event(sink, job_id, &current).await {
                close(sink).await;
                return;
            }
        }
        Err(AppError::NotFound(_)) => debug!(%job_id, "no stored status yet"),
        Err(err) => {
            warn!(%job_id, error = %err, "job status unavailable");
            send_event(
                sink,
                job_id,
                &UpdateEvent::error("Job store unavailable", err.job_message()),
            )
            .await;
            close(sink).await;
            return;
        }
    }

    info!(%job_id, "live update connection established");
    let mut last_sent = Instant::now();

    loop {
        match subscription.try_next() {
            Ok(Some(payload)) => {
                if !send_text(sink, job_id, payload).await {
                    break;
                }
                last_sent = Instant::now();
            }
            Ok(None) if last_sent.elapsed() >= settings.ping_interval => {
                if !send_event(sink, job_id, &UpdateEvent::ping()).await {
                    break;
                }
                last_sent = Instant::now();
            }
            Ok(None) => sleep(settings.poll_interval).await,
            Err(err) => {
                warn!(%job_id, error = %err, "update channel failed");
                send_event(
                    sink,
                    job_id,
                    &UpdateEvent::error("Update channel failed", err.job_message()),
                )
                .await;
                break;
            }
        }
    }

    drop(subscription);
    close(sink).await;
    info!(%job_id, "live update connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        jobs::record::{JobStatus, JobStatusRecord},
        storage::db::SurrealDbClient,
    };
    use futures::channel::mpsc::{self, UnboundedReceiver};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn jobs() -> Arc<JobControl> {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("in-memory surrealdb");
        Arc::new(JobControl::new(Arc::new(db), Duration::from_secs(3600)))
    }

    async fn next_message(rx: &mut UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("message in time")
            .expect("gateway still sending")
    }

    async fn next_event(rx: &mut UnboundedReceiver<Message>) -> UpdateEvent {
        match next_message(rx).await {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn spawn_gateway(
        jobs: &Arc<JobControl>,
        job_id: &str,
        settings: GatewaySettings,
    ) -> (UnboundedReceiver<Message>, tokio::task::JoinHandle<()>) {
        let (mut tx, rx) = mpsc::unbounded::<Message>();
        let jobs = Arc::clone(jobs);
        let job_id = job_id.to_string();
        let handle = tokio::spawn(async move {
            run_gateway(&mut tx, &jobs, &job_id, &settings).await;
        });
        (rx, handle)
    }

    #[tokio::test]
    async fn sends_current_status_then_forwards_events() {
        let jobs = jobs().await;
        let mut record = JobStatusRecord::new("job_1", JobStatus::Running);
        record.progress = Some(40);
        record.message = Some("Epoch 5/50".to_string());
        assert!(jobs.store().try_write_status(&record).await.expect("write"));

        let settings = GatewaySettings {
            ping_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        };
        let (mut rx, handle) = spawn_gateway(&jobs, "job_1", settings);

        assert!(matches!(
            next_event(&mut rx).await,
            UpdateEvent::Connected { job_id, .. } if job_id == "job_1"
        ));
        assert_eq!(
            next_event(&mut rx).await,
            UpdateEvent::Status {
                status: JobStatus::Running,
                job_id: Some("job_1".to_string()),
                progress: Some(40),
                message: "Epoch 5/50".to_string(),
            }
        );

        let milestone = UpdateEvent::milestone(50, "halfway");
        jobs.channel().publish("job_1", &milestone).await;
        assert_eq!(next_event(&mut rx).await, milestone);

        drop(rx);
        jobs.channel()
            .publish("job_1", &UpdateEvent::milestone(60, "unheard"))
            .await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gateway stops after the client is gone")
            .expect("join");
    }

    #[tokio::test]
    async fn idle_connection_receives_pings() {
        let jobs = jobs().await;
        let settings = GatewaySettings {
            ping_interval: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        };
        let (mut rx, handle) = spawn_gateway(&jobs, "job_quiet", settings);

        assert!(matches!(next_event(&mut rx).await, UpdateEvent::Connected { .. }));
        assert!(matches!(next_event(&mut rx).await, UpdateEvent::Ping { .. }));

        handle.abort();
    }

    #[tokio::test]
    async fn unavailable_store_reports_error_and_closes() {
        let jobs = Arc::new(JobControl::new(
            Arc::new(SurrealDbClient::disconnected()),
            Duration::from_secs(3600),
        ));
        let settings = GatewaySettings {
            ping_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        };
        let (mut rx, handle) = spawn_gateway(&jobs, "job_1", settings);

        assert!(matches!(next_event(&mut rx).await, UpdateEvent::Connected { .. }));
        assert!(matches!(next_event(&mut rx).await, UpdateEvent::Error { .. }));
        assert!(matches!(next_message(&mut rx).await, Message::Close(None)));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gateway returns")
            .expect("join");
    }
}
