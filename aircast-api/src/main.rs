use clap::Parser;
use std::path::PathBuf;

use aircast_api::ApiContext;
use aircast_core::config::Config;
use aircast_core::logging::init_logging;

#[derive(Parser)]
#[command(name = "aircast-api", about = "Aircast control API")]
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
    tracing::info!(config = ?config, "Starting aircast-api");

    let kv = aircast_core::kv::connect(&config.kv)?;
    let bus = aircast_bus::connect(&config.bus)?;
    let (router, context) = ApiContext::start(kv, bus, &config).await?;

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down");
    context.stop().await;
    Ok(())
}
