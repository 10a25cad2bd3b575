//! Session lifecycle: at most one open session per device, persisted rows,
//! and the stale-session sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use ctg_protocol::series::TimeSeries;

use crate::buffer::WriteBuffer;

/// Open sessions older than this many hours are force-closed by the sweep.
const STALE_SESSION_HOURS: i64 = 24;
/// Sweep worker tick.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// How long a close waits for the ingest worker to release parked samples.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("an active session already exists for device {0}")]
    AlreadyActive(String),
    #[error("active session {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Sent to the ingest worker when a device's session closes, so parked
/// filter samples reach the write buffer before its final flush. The ack is
/// best-effort with a bounded wait.
#[derive(Debug)]
pub struct CloseNotice {
    pub session_id: Uuid,
    pub device_id: String,
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSession {
    pub id: Uuid,
    pub card_id: Uuid,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosedSession {
    pub id: Uuid,
    pub card_id: Uuid,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Full persisted row, JSONB series included.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub card_id: Uuid,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub fhr_data: Json<TimeSeries>,
    pub uc_data: Json<TimeSeries>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSessionStats {
    pub session_id: Uuid,
    pub card_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub active_sessions: usize,
    pub devices: HashMap<String, DeviceSessionStats>,
    pub total_sessions: i64,
}

pub struct SessionManager {
    pool: PgPool,
    buffer: WriteBuffer,
    active: Mutex<HashMap<String, ActiveSession>>,
    close_tx: mpsc::Sender<CloseNotice>,
    export_tx: mpsc::Sender<Uuid>,
}

impl SessionManager {
    pub fn new(
        pool: PgPool,
        buffer: WriteBuffer,
        close_tx: mpsc::Sender<CloseNotice>,
        export_tx: mpsc::Sender<Uuid>,
    ) -> Self {
        info!("session manager initialised");
        Self {
            pool,
            buffer,
            active: Mutex::new(HashMap::new()),
            close_tx,
            export_tx,
        }
    }

    /// Open a session for a device. The row is inserted while the map lock
    /// is held so two racing starts for one device cannot both succeed.
    pub async fn start_session(
        &self,
        card_id: Uuid,
        device_id: &str,
    ) -> Result<ActiveSession, SessionError> {
        let mut active = self.active.lock().await;
        if active.contains_key(device_id) {
            return Err(SessionError::AlreadyActive(device_id.to_string()));
        }

        let session = ActiveSession {
            id: Uuid::new_v4(),
            card_id,
            device_id: device_id.to_string(),
            start_time: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO ctg_sessions (id, card_id, device_id, start_time, fhr_data, uc_data)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(session.id)
        .bind(session.card_id)
        .bind(&session.device_id)
        .bind(session.start_time)
        .bind(Json(TimeSeries::default()))
        .bind(Json(TimeSeries::default()))
        .execute(&self.pool)
        .await?;

        active.insert(session.device_id.clone(), session.clone());
        info!(session_id = %session.id, device_id, card_id = %card_id, "session started");
        Ok(session)
    }

    /// Close an open session: set `end_time`, release parked filter samples,
    /// flush the write buffer one last time, and schedule the export.
    /// A second stop for the same id returns `NotFound`.
    pub async fn stop_session(&self, session_id: Uuid) -> Result<ClosedSession, SessionError> {
        let closed = {
            let mut active = self.active.lock().await;
            let device_id = active
                .iter()
                .find(|(_, s)| s.id == session_id)
                .map(|(device_id, _)| device_id.clone())
                .ok_or(SessionError::NotFound(session_id))?;

            let end_time = Utc::now();
            sqlx::query("UPDATE ctg_sessions SET end_time = $1 WHERE id = $2")
                .bind(end_time)
                .bind(session_id)
                .execute(&self.pool)
                .await?;

            let session = match active.remove(&device_id) {
                Some(session) => session,
                None => return Err(SessionError::NotFound(session_id)),
            };
            ClosedSession {
                id: session.id,
                card_id: session.card_id,
                device_id: session.device_id,
                start_time: session.start_time,
                end_time,
            }
        };

        self.finalise(&closed).await;
        info!(session_id = %closed.id, device_id = %closed.device_id, "session stopped");
        Ok(closed)
    }

    /// Post-close plumbing, shared with the sweep: drain the filter holdback
    /// through the ingest worker, final-flush the buffer, schedule export.
    async fn finalise(&self, closed: &ClosedSession) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let notice = CloseNotice {
            session_id: closed.id,
            device_id: closed.device_id.clone(),
            ack: ack_tx,
        };
        if self.close_tx.send(notice).await.is_ok() {
            if tokio::time::timeout(CLOSE_ACK_TIMEOUT, ack_rx).await.is_err() {
                warn!(session_id = %closed.id, "timed out waiting for ingest close ack");
            }
        }

        self.buffer.remove_session(closed.id).await;

        if self.export_tx.try_send(closed.id).is_err() {
            warn!(session_id = %closed.id, "export queue unavailable, session not exported");
        }
    }

    pub async fn get_active(&self, device_id: &str) -> Option<ActiveSession> {
        self.active.lock().await.get(device_id).cloned()
    }

    pub async fn list_active(&self) -> Vec<ActiveSession> {
        self.active.lock().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn get_stored(&self, session_id: Uuid) -> Result<Option<SessionRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, card_id, device_id, start_time, end_time, fhr_data, uc_data
             FROM ctg_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_by_card(&self, card_id: Uuid) -> Result<Vec<SessionRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, card_id, device_id, start_time, end_time, fhr_data, uc_data
             FROM ctg_sessions WHERE card_id = $1 ORDER BY start_time DESC",
        )
        .bind(card_id)
        .fetch_all(&self.pool)
        .await
    }

    /// All device ids ever seen in the session table.
    pub async fn list_devices(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT DISTINCT device_id FROM ctg_sessions ORDER BY device_id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn statistics(&self) -> Result<SessionStatistics, sqlx::Error> {
        let active = self.list_active().await;
        let now = Utc::now();
        let devices = active
            .iter()
            .map(|s| {
                (
                    s.device_id.clone(),
                    DeviceSessionStats {
                        session_id: s.id,
                        card_id: s.card_id,
                        start_time: s.start_time,
                        duration_seconds: (now - s.start_time).num_seconds(),
                    },
                )
            })
            .collect();

        let total_sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ctg_sessions")
            .fetch_one(&self.pool)
            .await?;

        Ok(SessionStatistics {
            active_sessions: active.len(),
            devices,
            total_sessions,
        })
    }

    /// Force-close every open session older than 24 h. Device drop-outs would
    /// otherwise pin their buffers forever. Returns the number closed.
    pub async fn sweep(&self) -> usize {
        let threshold = Utc::now() - chrono::Duration::hours(STALE_SESSION_HOURS);
        let stale: Vec<Uuid> = self
            .active
            .lock()
            .await
            .values()
            .filter(|s| s.start_time < threshold)
            .map(|s| s.id)
            .collect();

        let mut closed = 0;
        for session_id in stale {
            match self.stop_session(session_id).await {
                Ok(session) => {
                    warn!(
                        session_id = %session.id,
                        device_id = %session.device_id,
                        "force-closed stale session"
                    );
                    closed += 1;
                }
                // Already gone: an operator stop raced the sweep.
                Err(SessionError::NotFound(_)) => {}
                Err(e) => warn!(%session_id, error = %e, "failed to force-close stale session"),
            }
        }
        closed
    }

    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.tick().await; // immediate first tick
        info!("session sweeper started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let closed = self.sweep().await;
                    if closed > 0 {
                        info!(closed, "stale session sweep complete");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("session sweeper stopping");
                    return;
                }
            }
        }
    }
}
