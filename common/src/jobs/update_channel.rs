use std::{pin::Pin, sync::Arc};

use chrono::Utc;
use futures::{FutureExt, Stream, StreamExt};
use surrealdb::{Action, Notification};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::job_event::JobEvent},
};

use super::events::UpdateEvent;

type NotificationStream =
    Pin<Box<dyn Stream<Item = Result<Notification<JobEvent>, surrealdb::Error>> + Send>>;

/// Per-job fan-out of transient events. Nothing is retained: an event only
/// reaches listeners subscribed at the moment it is published.
#[derive(Clone)]
pub struct UpdateChannel {
    db: Arc<SurrealDbClient>,
}

impl UpdateChannel {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Fire-and-forget. Failures are logged, never returned.
    pub async fn publish(&self, job_id: &str, event: &UpdateEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%job_id, error = %err, "failed to serialize update event");
                return;
            }
        };

        let now = Utc::now();
        let row = JobEvent {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            job_id: job_id.to_string(),
            payload,
        };
        let event_id = row.id.clone();

        if let Err(err) = self.db.store_item(row).await {
            warn!(%job_id, kind = event.kind(), error = %err, "failed to publish update event");
            return;
        }

        if let Err(err) = self.db.delete_item::<JobEvent>(&event_id).await {
            debug!(%job_id, error = %err, "failed to drop published event row");
        }
    }

    /// Starts listening for events of one job. Dropping the returned
    /// subscription ends the underlying live query.
    pub async fn subscribe(&self, job_id: &str) -> Result<Subscription, AppError> {
        let stream = self.db.listen::<JobEvent>().await?;

        Ok(Subscription {
            job_id: job_id.to_string(),
            stream: Box::pin(stream),
        })
    }
}

pub struct Subscription {
    job_id: String,
    stream: NotificationStream,
}

impl Subscription {
    fn accept(&self, notification: Notification<JobEvent>) -> Option<String> {
        (matches!(notification.action, Action::Create) && notification.data.job_id == self.job_id)
            .then_some(notification.data.payload)
    }

    /// Returns the next pending event payload without waiting, `Ok(None)` when
    /// nothing is pending, or an error once the channel has closed.
    pub fn try_next(&mut self) -> Result<Option<String>, AppError> {
        loop {
            match self.stream.next().now_or_never() {
                None => return Ok(None),
                Some(None) => {
                    return Err(AppError::Unavailable("update channel closed".to_string()))
                }
                Some(Some(Err(err))) => return Err(err.into()),
                Some(Some(Ok(notification))) => {
                    if let Some(payload) = self.accept(notification) {
                        return Ok(Some(payload));
                    }
                }
            }
        }
    }

    /// Waits for the next event payload of this job.
    pub async fn next(&mut self) -> Result<String, AppError> {
        loop {
            match self.stream.next().await {
                None => return Err(AppError::Unavailable("update channel closed".to_string())),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(notification)) => {
                    if let Some(payload) = self.accept(notification) {
                        return Ok(payload);
                    }
                }
            }
        }
    }
}
