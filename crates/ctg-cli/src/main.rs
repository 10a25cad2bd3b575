use clap::{Parser, Subcommand};
use serde_json::Value;

use ctg_grpc::ctg::ctg_stream_service_client::CtgStreamServiceClient;
use ctg_grpc::ctg::StreamRequest;

#[derive(Parser, Debug)]
#[command(name = "ctg", about = "CTG monitor management CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Admin API URL
    #[arg(short, long, default_value = "http://localhost:8080", global = true)]
    url: String,

    /// gRPC stream server address
    #[arg(short, long, default_value = "http://localhost:50051", global = true)]
    grpc: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the live sample stream
    Stream {
        /// Comma-separated device ids (empty = all devices)
        #[arg(long, default_value = "")]
        devices: String,
        /// Comma-separated data types (empty = all types)
        #[arg(long, default_value = "")]
        types: String,
    },
    /// Follow the periodic batch stream
    Batch {
        /// Comma-separated device ids (empty = all devices)
        #[arg(long, default_value = "")]
        devices: String,
    },
    /// Show service health
    Status,
    /// Show session and pipeline statistics
    Stats,
    /// List devices known to the monitor
    Devices,
    /// List active sessions
    Active,
    /// Start a monitoring session
    Start {
        /// Patient card UUID
        card_id: String,
        /// CTG device id
        device_id: String,
    },
    /// Stop a session (triggers the medical-records export)
    Stop {
        /// Session UUID
        session_id: String,
    },
    /// Force-close stale sessions now
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_string();

    match args.command {
        Commands::Stream { devices, types } => {
            follow_stream(&args.grpc, split_and_trim(&devices), split_and_trim(&types)).await?;
        }
        Commands::Batch { devices } => {
            follow_batches(&args.grpc, split_and_trim(&devices)).await?;
        }
        Commands::Status => {
            let resp: Value = client
                .get(format!("{}/api/v1/monitoring/health", base))
                .send().await?
                .json().await?;
            println!("CTG Monitor");
            println!("══════════════════════════════");
            println!("  Status:           {}", resp["status"].as_str().unwrap_or("?"));
            println!("  Database:         {}", resp["database"].as_str().unwrap_or("?"));
            println!("  Uptime:           {}s", resp["uptime_seconds"]);
            println!("  Active sessions:  {}", resp["active_sessions"]);
        }
        Commands::Stats => {
            let resp: Value = client
                .get(format!("{}/api/v1/monitoring/stats", base))
                .send().await?
                .json().await?;
            println!("Sessions");
            println!("  Active:           {}", resp["sessions"]["active_sessions"]);
            println!("  Total stored:     {}", resp["sessions"]["total_sessions"]);
            println!("Subscribers");
            println!("  Stream:           {}", resp["stream_subscribers"]);
            println!("  Batch:            {}", resp["batch_subscribers"]);
            println!("Pipeline");
            let pipeline = &resp["pipeline"];
            for key in [
                "samples_ingested",
                "parse_failures",
                "queue_drops",
                "spikes_replaced",
                "signal_losses",
                "subscriber_drops",
                "batch_drops",
                "batches_flushed",
                "points_flushed",
                "flush_failures",
                "sessions_exported",
                "export_failures",
            ] {
                println!("  {:<18}{}", key, pipeline[key]);
            }
        }
        Commands::Devices => {
            let resp: Value = client
                .get(format!("{}/api/v1/devices", base))
                .send().await?
                .json().await?;
            println!("Devices ({})", resp["count"]);
            if let Some(devices) = resp["devices"].as_array() {
                for device in devices {
                    println!("  {}", device.as_str().unwrap_or("?"));
                }
            }
        }
        Commands::Active => {
            let resp: Value = client
                .get(format!("{}/api/v1/sessions/active", base))
                .send().await?
                .json().await?;
            println!("Active sessions ({})", resp["count"]);
            if let Some(sessions) = resp["sessions"].as_array() {
                for session in sessions {
                    println!(
                        "  {}  device={}  card={}  {}s",
                        session["session_id"].as_str().unwrap_or("?"),
                        session["device_id"].as_str().unwrap_or("?"),
                        session["card_id"].as_str().unwrap_or("?"),
                        session["duration_seconds"],
                    );
                }
            }
        }
        Commands::Start { card_id, device_id } => {
            let resp = client
                .post(format!("{}/api/v1/sessions/start", base))
                .json(&serde_json::json!({ "card_id": card_id, "device_id": device_id }))
                .send().await?;
            let status = resp.status();
            let body: Value = resp.json().await?;
            if status.is_success() {
                println!("Session started: {}", body["session_id"].as_str().unwrap_or("?"));
            } else {
                println!("Start failed ({}): {}", status, body["error"].as_str().unwrap_or("?"));
            }
        }
        Commands::Stop { session_id } => {
            let resp = client
                .post(format!("{}/api/v1/sessions/stop/{}", base, session_id))
                .send().await?;
            let status = resp.status();
            let body: Value = resp.json().await?;
            if status.is_success() {
                println!(
                    "Session stopped after {}s, export scheduled",
                    body["duration_seconds"]
                );
            } else {
                println!("Stop failed ({}): {}", status, body["error"].as_str().unwrap_or("?"));
            }
        }
        Commands::Cleanup => {
            let resp: Value = client
                .post(format!("{}/api/v1/monitoring/cleanup", base))
                .send().await?
                .json().await?;
            println!(
                "Cleanup done: {} closed, {} still active",
                resp["closed_sessions"], resp["active_sessions"]
            );
        }
    }

    Ok(())
}

async fn follow_stream(
    addr: &str,
    device_ids: Vec<String>,
    data_types: Vec<String>,
) -> anyhow::Result<()> {
    let mut client = CtgStreamServiceClient::connect(addr.to_string()).await?;
    let request = StreamRequest {
        device_ids,
        data_types,
    };
    let mut stream = client.stream_ctg_data(request).await?.into_inner();
    println!("Connected to {} (Ctrl-C to exit)", addr);

    while let Some(sample) = stream.message().await? {
        let value = if sample.value == -1.0 {
            "SIGNAL_LOSS".to_string()
        } else {
            format!("{:.2}", sample.value)
        };
        println!(
            "[{}] {:<22} {:>12}  (t={:.3}s)",
            sample.device_id, sample.data_type, value, sample.time_sec
        );
    }
    println!("Stream closed by server");
    Ok(())
}

async fn follow_batches(addr: &str, device_ids: Vec<String>) -> anyhow::Result<()> {
    let mut client = CtgStreamServiceClient::connect(addr.to_string()).await?;
    let request = StreamRequest {
        device_ids,
        data_types: Vec::new(),
    };
    let mut stream = client.stream_batch_ctg_data(request).await?.into_inner();
    println!("Connected to {} (Ctrl-C to exit)", addr);

    while let Some(batch) = stream.message().await? {
        let at = chrono::DateTime::from_timestamp_nanos(batch.timestamp);
        println!("=== Batch at {} — {} samples ===", at.to_rfc3339(), batch.count);
        for sample in &batch.data {
            println!(
                "  [{}] {:<22} {:>8.2}  (t={:.3}s)",
                sample.device_id, sample.data_type, sample.value, sample.time_sec
            );
        }
    }
    println!("Stream closed by server");
    Ok(())
}

fn split_and_trim(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
