use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use aircast_core::config::Config;
use aircast_core::logging::init_logging;
use aircast_mixer::{FfmpegPipeline, MixerWorker};

#[derive(Parser)]
#[command(name = "aircast-mixer", about = "Aircast mixer worker")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    init_logging(&config.logging)?;
    tracing::info!(config = ?config, "Starting aircast-mixer");

    let kv = aircast_core::kv::connect(&config.kv)?;
    let pipeline = Arc::new(FfmpegPipeline::new(&config.mixer));
    let mut worker = MixerWorker::start(kv, &config, pipeline).await?;

    let health = axum::Router::new().route(
        "/health",
        axum::routing::get(|| async { axum::Json(serde_json::json!({"status": "ok"})) }),
    );
    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Health endpoint listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    worker.stop().await;
    server.abort();
    Ok(())
}
