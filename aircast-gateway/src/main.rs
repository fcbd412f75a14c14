use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aircast_bus::{ConsumerMode, Notifier, Peer};
use aircast_core::config::Config;
use aircast_core::crypto::{ResumeTokenCodec, RoomTokenService};
use aircast_core::logging::init_logging;
use aircast_gateway::{ClientHub, GatewayState, NotifyBridge, SessionGuard};

#[derive(Parser)]
#[command(name = "aircast-gateway", about = "Aircast signaling gateway")]
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
    tracing::info!(config = ?config, "Starting aircast-gateway");

    let server_id = config.server.effective_server_id();
    let kv = aircast_core::kv::connect(&config.kv)?;
    let bus = aircast_bus::connect(&config.bus)?;

    let tokens = RoomTokenService::new(
        config.token.secret.as_bytes(),
        config.token.parse_algorithm()?,
        chrono::Duration::hours(config.token.token_ttl_hours),
    )?;
    let resume_codec = if config.gateway.resume_key_hex.is_empty() {
        None
    } else {
        Some(ResumeTokenCodec::new(&config.gateway.resume_key()?)?)
    };

    let hub = Arc::new(ClientHub::new());
    let guard = Arc::new(SessionGuard::new(
        kv,
        config.kv.layout.clone(),
        server_id.clone(),
        Duration::from_secs(config.gateway.session_guard_ttl_secs),
        Notifier::new(bus.clone(), config.bus.gateway_notify_stream.clone()),
    ));

    let status_peer = Arc::new(Peer::new(
        bus.clone(),
        config.bus.status_request_stream.clone(),
        config.bus.status_reply_stream.clone(),
        ConsumerMode::Broadcast,
    ));
    status_peer.open().await?;

    let bridge = NotifyBridge::start(
        bus,
        hub.clone(),
        server_id,
        &config.bus.status_notify_stream,
        &config.bus.gateway_notify_stream,
    )
    .await?;

    let state = Arc::new(GatewayState {
        hub,
        guard,
        status_peer: status_peer.clone(),
        tokens,
        resume_codec,
    });
    let app = aircast_gateway::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down");
    bridge.stop().await;
    status_peer.close().await;
    Ok(())
}
