mod admin;
mod buffer;
mod config;
mod db;
mod export;
mod grpc;
mod hub;
mod ingest;
mod metrics;
mod sessions;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::WriteBuffer;
use crate::export::ExportClient;
use crate::hub::FanoutHub;
use crate::ingest::{IngestWorker, INGEST_QUEUE_CAPACITY};
use crate::metrics::PipelineCounters;
use crate::sessions::SessionManager;

/// Bound on each shutdown step; exceeding it proceeds anyway.
const SHUTDOWN_STEP_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "ctg-monitor", about = "CTG telemetry ingestion and fan-out daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/monitor.toml", env = "CTG_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config::load(&args.config)?;

    info!(
        grpc = %config.grpc.listen,
        mqtt_host = %config.mqtt.host,
        admin_enabled = config.admin.enabled,
        "CTG monitor starting"
    );

    // Database first; everything downstream shares the pool.
    let pool = db::connect(&config.database).await?;
    db::run_migrations(&pool).await?;

    let counters = Arc::new(PipelineCounters::default());

    // Write-behind buffer and its flush worker.
    let write_buffer = WriteBuffer::new(pool.clone(), counters.clone());
    let buffer_cancel = CancellationToken::new();
    let buffer_handle = tokio::spawn(write_buffer.clone().run_worker(buffer_cancel.clone()));

    // Close notices flow from the session manager to the ingest worker so
    // parked filter samples land before a closing session's final flush;
    // export jobs flow to the export worker.
    let (close_tx, close_rx) = mpsc::channel(16);
    let (export_tx, export_rx) = mpsc::channel(64);

    // Session manager and the stale-session sweeper.
    let sessions = Arc::new(SessionManager::new(
        pool.clone(),
        write_buffer.clone(),
        close_tx,
        export_tx,
    ));
    let sweep_cancel = CancellationToken::new();
    let sweep_handle = tokio::spawn(sessions.clone().run_sweeper(sweep_cancel.clone()));

    // Fan-out hub, its batch ticker, and the gRPC surface.
    let hub = Arc::new(FanoutHub::new(counters.clone()));
    let hub_cancel = CancellationToken::new();
    let hub_handle = tokio::spawn(hub.clone().run_batch_ticker(hub_cancel.clone()));

    let grpc_listen: SocketAddr = config
        .grpc
        .listen
        .parse()
        .context("invalid grpc listen address")?;
    let grpc_cancel = CancellationToken::new();
    let mut grpc_handle = {
        let hub = hub.clone();
        let cancel = grpc_cancel.clone();
        tokio::spawn(async move { grpc::serve(hub, grpc_listen, cancel).await })
    };

    // Ingest: the worker first, then the broker reader that feeds it.
    let (sample_tx, sample_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
    let worker_cancel = CancellationToken::new();
    let worker = IngestWorker::new(
        sessions.clone(),
        write_buffer.clone(),
        hub.clone(),
        counters.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(sample_rx, close_rx, worker_cancel.clone()));

    let mqtt_cancel = CancellationToken::new();
    let mqtt_handle = tokio::spawn(ingest::run_mqtt(
        config.mqtt.clone(),
        sample_tx,
        counters.clone(),
        mqtt_cancel.clone(),
    ));

    // Export client for closed sessions.
    let exporter = ExportClient::new(pool.clone(), &config.export.target, counters.clone())?;
    let export_cancel = CancellationToken::new();
    let export_handle = tokio::spawn(exporter.run(export_rx, export_cancel.clone()));

    // Admin surface.
    let admin_cancel = CancellationToken::new();
    let mut admin_handle = if config.admin.enabled {
        let state = admin::AdminState {
            sessions: sessions.clone(),
            hub: hub.clone(),
            buffer: write_buffer.clone(),
            counters: counters.clone(),
            pool: pool.clone(),
            started_at: Instant::now(),
        };
        let listen: SocketAddr = config
            .admin
            .listen
            .parse()
            .context("invalid admin listen address")?;
        let cancel = admin_cancel.clone();
        Some(tokio::spawn(
            async move { admin::serve(state, listen, cancel).await },
        ))
    } else {
        None
    };

    info!("CTG monitor running");
    wait_for_shutdown(&mut grpc_handle, admin_handle.as_mut()).await?;
    info!("shutting down");

    // Stop accepting subscribers and admin calls.
    grpc_cancel.cancel();
    admin_cancel.cancel();
    join_step("grpc", grpc_handle).await;
    if let Some(handle) = admin_handle {
        join_step("admin", handle).await;
    }

    // Stop pub/sub delivery, then drain the ingest queue and release parked
    // filter samples into the write buffer.
    mqtt_cancel.cancel();
    join_step("mqtt", mqtt_handle).await;
    worker_cancel.cancel();
    join_step("ingest", worker_handle).await;

    // Hub: stop the ticker and deliver whatever accumulated.
    hub_cancel.cancel();
    join_step("hub", hub_handle).await;

    // Final flush of every session buffer.
    buffer_cancel.cancel();
    join_step("buffer-worker", buffer_handle).await;
    write_buffer.stop().await;

    sweep_cancel.cancel();
    join_step("sweeper", sweep_handle).await;
    export_cancel.cancel();
    join_step("export", export_handle).await;

    pool.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Block until SIGINT/SIGTERM. An early exit of the gRPC or admin server
/// (e.g. a port that cannot be bound) is a fatal init error instead.
async fn wait_for_shutdown(
    grpc: &mut JoinHandle<anyhow::Result<()>>,
    admin: Option<&mut JoinHandle<anyhow::Result<()>>>,
) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let admin_exit = async {
        match admin {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
            Ok(())
        }
        result = grpc => match result {
            Ok(Ok(())) => anyhow::bail!("gRPC server exited unexpectedly"),
            Ok(Err(e)) => Err(e).context("gRPC server failed"),
            Err(e) => Err(e).context("gRPC server panicked"),
        },
        result = admin_exit => match result {
            Ok(Ok(())) => anyhow::bail!("admin API exited unexpectedly"),
            Ok(Err(e)) => Err(e).context("admin API failed"),
            Err(e) => Err(e).context("admin API panicked"),
        },
    }
}

async fn join_step<T>(step: &str, handle: JoinHandle<T>) {
    if tokio::time::timeout(SHUTDOWN_STEP_WAIT, handle).await.is_err() {
        warn!(step, "shutdown step exceeded its bound, proceeding");
    }
}
