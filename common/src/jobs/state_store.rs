use std::{sync::Arc, time::Duration};

use chrono::Utc;
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, error, warn};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{job_signal::JobSignals, job_status_entry::JobStatusEntry, StoredObject},
    },
};

use super::record::{JobStatus, JobStatusRecord};

fn terminal_tags() -> Vec<&'static str> {
    [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
        .iter()
        .map(JobStatus::as_str)
        .collect()
}

/// Latest status snapshot per job plus the pause/cancel flags.
#[derive(Clone)]
pub struct JobStateStore {
    db: Arc<SurrealDbClient>,
    ttl: Duration,
}

impl JobStateStore {
    pub fn new(db: Arc<SurrealDbClient>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    /// Best-effort write; failures are logged and swallowed. Returns whether
    /// the record landed.
    pub async fn write_status(&self, record: &JobStatusRecord) -> bool {
        match self.try_write_status(record).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    job_id = %record.job_id,
                    status = %record.status,
                    "status write skipped, job already finished"
                );
                false
            }
            Err(err) => {
                warn!(
                    job_id = %record.job_id,
                    status = %record.status,
                    error = %err,
                    "failed to write job status"
                );
                false
            }
        }
    }

    /// Writes a terminal status, retrying with a reconnect between attempts.
    /// Returns whether the record was stored.
    pub async fn write_status_durable(&self, record: &JobStatusRecord) -> bool {
        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);

        let result = Retry::spawn(retry_strategy, || async move {
            match self.try_write_status(record).await {
                Ok(written) => Ok(written),
                Err(err) => {
                    warn!(job_id = %record.job_id, error = %err, "status write failed, reconnecting");
                    if let Err(reconnect_err) = self.db.reconnect().await {
                        warn!(error = %reconnect_err, "reconnect failed");
                    }
                    Err(err)
                }
            }
        })
        .await;

        match result {
            Ok(written) => written,
            Err(err) => {
                error!(
                    job_id = %record.job_id,
                    status = %record.status,
                    error = %err,
                    "giving up on job status write"
                );
                false
            }
        }
    }

    /// Stores the record under its job id with a fresh expiry. A finished
    /// job's record is never replaced by one with a different status; in that
    /// case nothing is written and `false` is returned.
    ///
    /// The guard is evaluated inside the update statement itself, so two
    /// concurrent terminal writes cannot both pass it. The first record of a
    /// job is created separately; losing that race falls back to the guarded
    /// update.
    pub async fn try_write_status(&self, record: &JobStatusRecord) -> Result<bool, AppError> {
        const GUARDED_UPDATE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $status,
                payload = $payload,
                expires_at = $expires_at,
                updated_at = $now
            WHERE status NOT IN $terminal_states
               OR status = $status
               OR expires_at <= $now
            RETURN AFTER;
        "#;

        let payload = serde_json::to_string(record)?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        for _ in 0..2 {
            let updated: Option<JobStatusEntry> = self
                .db
                .handle()
                .query(GUARDED_UPDATE_QUERY)
                .bind(("table", JobStatusEntry::table_name()))
                .bind(("id", record.job_id.clone()))
                .bind(("status", record.status.as_str()))
                .bind(("payload", payload.clone()))
                .bind(("expires_at", SurrealDatetime::from(expires_at)))
                .bind(("now", SurrealDatetime::from(now)))
                .bind(("terminal_states", terminal_tags()))
                .await?
                .take(0)?;
            if updated.is_some() {
                return Ok(true);
            }

            let entry = JobStatusEntry {
                id: record.job_id.clone(),
                created_at: now,
                updated_at: now,
                status: record.status.as_str().to_string(),
                payload: payload.clone(),
                expires_at,
            };
            match self.db.store_item(entry).await {
                Ok(_) => return Ok(true),
                Err(err) => {
                    // Creation only fails benignly when the record exists
                    if self
                        .db
                        .get_item::<JobStatusEntry>(&record.job_id)
                        .await?
                        .is_none()
                    {
                        return Err(err.into());
                    }
                }
            }
        }

        Ok(false)
    }

    /// Serialized record exactly as written, or `None` if missing or expired.
    /// Store failures surface as [`AppError::Unavailable`].
    pub async fn read_status_raw(&self, job_id: &str) -> Result<Option<String>, AppError> {
        let entry = self
            .db
            .get_item::<JobStatusEntry>(job_id)
            .await
            .map_err(|e| AppError::Unavailable(format!("job status store: {e}")))?;

        Ok(entry
            .filter(|entry| !entry.is_expired(Utc::now()))
            .map(|entry| entry.payload))
    }

    pub async fn read_status(&self, job_id: &str) -> Result<Option<JobStatusRecord>, AppError> {
        match self.read_status_raw(job_id).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Deletes records whose retention window has passed.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        let removed: Vec<JobStatusEntry> = self
            .db
            .handle()
            .query("DELETE type::table($table) WHERE expires_at <= $now RETURN BEFORE")
            .bind(("table", JobStatusEntry::table_name()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        Ok(removed.len())
    }

    async fn set_flag(&self, job_id: &str, field: &'static str, value: bool) -> Result<(), AppError> {
        let query = format!(
            "UPSERT type::thing($table, $id) SET {field} = $value, updated_at = $now RETURN NONE"
        );
        self.db
            .handle()
            .query(query)
            .bind(("table", JobSignals::table_name()))
            .bind(("id", job_id.to_string()))
            .bind(("value", value))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn set_pause(&self, job_id: &str) -> Result<(), AppError> {
        self.set_flag(job_id, "paused", true).await
    }

    pub async fn clear_pause(&self, job_id: &str) -> Result<(), AppError> {
        self.set_flag(job_id, "paused", false).await
    }

    pub async fn set_cancel(&self, job_id: &str) -> Result<(), AppError> {
        self.set_flag(job_id, "cancel_requested", true).await
    }

    /// Current flags; absent row means no signal.
    pub async fn read_signals(&self, job_id: &str) -> Result<JobSignals, AppError> {
        let signals = self.db.get_item::<JobSignals>(job_id).await?;
        Ok(signals.unwrap_or_else(|| JobSignals {
            id: job_id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            paused: false,
            cancel_requested: false,
        }))
    }

    pub async fn clear_signals(&self, job_id: &str) -> Result<(), AppError> {
        let _: Option<JobSignals> = self.db.delete_item(job_id).await?;
        Ok(())
    }
}
