//! Export client: forwards closed sessions to the medical-records service.
//! Strictly best-effort — a failed or timed-out export is logged and
//! abandoned; the session stays persisted locally.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};
use uuid::Uuid;

use ctg_grpc::medical_records::medical_records_service_client::MedicalRecordsServiceClient;
use ctg_grpc::medical_records::{CtgDataPoint, CtgSessionRequest};

use crate::metrics::PipelineCounters;
use crate::sessions::SessionRow;

/// Per-export deadline; on expiry the request is cancelled, not retried.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ExportClient {
    pool: PgPool,
    client: MedicalRecordsServiceClient<Channel>,
    counters: Arc<PipelineCounters>,
}

impl ExportClient {
    /// The channel connects lazily, so a missing records service never
    /// blocks monitor startup.
    pub fn new(
        pool: PgPool,
        target: &str,
        counters: Arc<PipelineCounters>,
    ) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(target.to_string())?
            .timeout(EXPORT_TIMEOUT)
            .connect_lazy();
        info!(endpoint = target, "medical-records export client initialised");
        Ok(Self {
            pool,
            client: MedicalRecordsServiceClient::new(channel),
            counters,
        })
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Uuid>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(session_id) => self.export_session(session_id).await,
                    None => return,
                },
                _ = cancel.cancelled() => {
                    info!("export worker stopping");
                    return;
                }
            }
        }
    }

    async fn export_session(&mut self, session_id: Uuid) {
        let row: SessionRow = match sqlx::query_as(
            "SELECT id, card_id, device_id, start_time, end_time, fhr_data, uc_data
             FROM ctg_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(%session_id, "session to export not found");
                return;
            }
            Err(e) => {
                warn!(%session_id, error = %e, "failed to load session for export");
                self.counters.export_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if row.end_time.is_none() {
            warn!(%session_id, "refusing to export a session that is still open");
            return;
        }

        let request = build_request(&row);
        info!(
            %session_id,
            fhr_points = request.total_fhr_points,
            uc_points = request.total_uc_points,
            "exporting session to medical records"
        );

        match self.client.save_ctg_session(request).await {
            Ok(response) => {
                let response = response.into_inner();
                if response.success {
                    info!(%session_id, record_id = %response.record_id, "session exported");
                    self.counters.sessions_exported.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!(%session_id, message = %response.message, "records service rejected session");
                    self.counters.export_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(status) => {
                warn!(%session_id, status = %status, "export RPC failed");
                self.counters.export_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn build_request(row: &SessionRow) -> CtgSessionRequest {
    let fhr_data: Vec<CtgDataPoint> = row
        .fhr_data
        .points
        .iter()
        .map(|p| CtgDataPoint {
            time_sec: p.t,
            value: p.v,
        })
        .collect();
    let uc_data: Vec<CtgDataPoint> = row
        .uc_data
        .points
        .iter()
        .map(|p| CtgDataPoint {
            time_sec: p.t,
            value: p.v,
        })
        .collect();

    let end_time = row.end_time.unwrap_or(row.start_time);
    CtgSessionRequest {
        session_id: row.id.to_string(),
        card_id: row.card_id.to_string(),
        device_id: row.device_id.clone(),
        start_time: row.start_time.timestamp(),
        end_time: end_time.timestamp(),
        duration_seconds: (end_time - row.start_time).num_seconds() as i32,
        total_fhr_points: fhr_data.len() as i32,
        total_uc_points: uc_data.len() as i32,
        fhr_data,
        uc_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ctg_protocol::series::{CtgPoint, TimeSeries};
    use sqlx::types::Json;

    #[test]
    fn test_build_request_assembles_whole_session() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 11, 30, 0).unwrap();
        let row = SessionRow {
            id: Uuid::new_v4(),
            card_id: Uuid::new_v4(),
            device_id: "CTG-001".to_string(),
            start_time: start,
            end_time: Some(end),
            fhr_data: Json(TimeSeries {
                points: vec![
                    CtgPoint { t: 0.0, v: 140.0 },
                    CtgPoint { t: 1.0, v: 141.0 },
                ],
                last_time: 1.0,
                count: 2,
            }),
            uc_data: Json(TimeSeries {
                points: vec![CtgPoint { t: 0.5, v: 22.0 }],
                last_time: 0.5,
                count: 1,
            }),
        };

        let request = build_request(&row);
        assert_eq!(request.session_id, row.id.to_string());
        assert_eq!(request.device_id, "CTG-001");
        assert_eq!(request.duration_seconds, 5400);
        assert_eq!(request.start_time, start.timestamp());
        assert_eq!(request.end_time, end.timestamp());
        assert_eq!(request.total_fhr_points, 2);
        assert_eq!(request.total_uc_points, 1);
        assert_eq!(request.fhr_data[1].value, 141.0);
        assert_eq!(request.uc_data[0].time_sec, 0.5);
    }
}
