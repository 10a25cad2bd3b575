//! PostgreSQL pool and startup migrations.

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::DatabaseSection;

const MIN_IDLE_CONNS: u32 = 10;
const MAX_OPEN_CONNS: u32 = 50;
const CONN_MAX_LIFETIME: Duration = Duration::from_secs(3600);
const CONN_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn connect(config: &DatabaseSection) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(MIN_IDLE_CONNS)
        .max_connections(MAX_OPEN_CONNS)
        .max_lifetime(CONN_MAX_LIFETIME)
        .idle_timeout(CONN_IDLE_TIMEOUT)
        .connect(&config.dsn())
        .await
        .context("failed to connect to PostgreSQL")?;

    info!(host = %config.host, dbname = %config.dbname, "connected to PostgreSQL");
    Ok(pool)
}

/// Create the session table and its indexes. Index failures are logged but
/// not fatal; the table itself is.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(CREATE_SESSIONS_TABLE)
        .execute(pool)
        .await
        .context("failed to create ctg_sessions table")?;

    for index_sql in INDEXES {
        if let Err(e) = sqlx::query(index_sql).execute(pool).await {
            warn!(error = %e, sql = index_sql, "failed to create index");
        }
    }

    info!("database migrations complete");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ctg_sessions (
    id         UUID PRIMARY KEY,
    card_id    UUID NOT NULL,
    device_id  VARCHAR(100) NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time   TIMESTAMPTZ,
    fhr_data   JSONB NOT NULL DEFAULT '{"points": [], "last_time": 0, "count": 0}',
    uc_data    JSONB NOT NULL DEFAULT '{"points": [], "last_time": 0, "count": 0}'
)
"#;

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_ctg_sessions_device_active ON ctg_sessions(device_id, end_time) WHERE end_time IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_ctg_sessions_start_time_desc ON ctg_sessions(start_time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ctg_sessions_card_device ON ctg_sessions(card_id, device_id)",
    "CREATE INDEX IF NOT EXISTS idx_ctg_sessions_fhr_gin ON ctg_sessions USING GIN (fhr_data)",
    "CREATE INDEX IF NOT EXISTS idx_ctg_sessions_uc_gin ON ctg_sessions USING GIN (uc_data)",
    "CREATE INDEX IF NOT EXISTS idx_active_sessions ON ctg_sessions(device_id, start_time) WHERE end_time IS NULL",
];
