use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::KeyLayout;
use crate::{Error, Result};

/// Application configuration shared by every aircast service.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub kv: KvConfig,
    pub bus: BusConfig,
    pub token: TokenConfig,
    pub logging: LoggingConfig,
    pub mixer: MixerConfig,
    pub presence: PresenceConfig,
    pub gateway: GatewayConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("kv", &self.kv)
            .field("bus", &self.bus)
            .field("token", &"<redacted>")
            .field("logging", &self.logging)
            .field("mixer", &self.mixer)
            .field("presence", &self.presence)
            .field("gateway", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration from an optional file plus `AIRCAST_*` env
    /// overrides (e.g. `AIRCAST_SERVER__HTTP_PORT=8080`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("AIRCAST")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::Internal(format!("Failed to load configuration: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Stable identity of this process in cross-process coordination.
    /// Falls back to the system hostname when empty.
    pub server_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            server_id: String::new(),
        }
    }
}

impl ServerConfig {
    /// The effective server identity: configured value or hostname.
    #[must_use]
    pub fn effective_server_id(&self) -> String {
        if !self.server_id.is_empty() {
            return self.server_id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "aircast-unknown".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Coordination-store endpoints. Empty means in-process store
    /// (single-node / test deployments).
    pub endpoints: Vec<String>,
    pub layout: KeyLayout,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            layout: KeyLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub redis_url: String,
    /// Stream carrying user-status RPC requests.
    pub status_request_stream: String,
    /// Stream carrying user-status RPC replies back to the gateways.
    pub status_reply_stream: String,
    /// Consumer group the status controller reads requests with.
    pub status_group: String,
    /// Broadcast stream carrying room-status notifications to gateways.
    pub status_notify_stream: String,
    /// Broadcast stream carrying gateway control notices (session preemption).
    pub gateway_notify_stream: String,
    /// Periodic trim: drop acked messages older than this.
    pub trim_max_age_secs: u64,
    /// Periodic trim: cap the acked prefix at this many messages.
    pub trim_max_len: u64,
    pub trim_interval_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            status_request_stream: "aircast:status:requests".to_string(),
            status_reply_stream: "aircast:status:replies".to_string(),
            status_group: "status-controller".to_string(),
            status_notify_stream: "aircast:status:notify".to_string(),
            gateway_notify_stream: "aircast:gateway:notify".to_string(),
            trim_max_age_secs: 3600,
            trim_max_len: 100_000,
            trim_interval_secs: 60,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Symmetric secret for room scope tokens.
    pub secret: String,
    /// HS256 (default), HS384 or HS512. Each verifier accepts exactly the
    /// configured algorithm.
    pub algorithm: String,
    pub token_ttl_hours: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: "HS256".to_string(),
            token_ttl_hours: 24,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("token_ttl_hours", &self.token_ttl_hours)
            .finish()
    }
}

impl TokenConfig {
    pub fn parse_algorithm(&self) -> Result<jsonwebtoken::Algorithm> {
        match self.algorithm.as_str() {
            "HS256" => Ok(jsonwebtoken::Algorithm::HS256),
            "HS384" => Ok(jsonwebtoken::Algorithm::HS384),
            "HS512" => Ok(jsonwebtoken::Algorithm::HS512),
            other => Err(Error::Internal(format!(
                "Unsupported token algorithm: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, anything else is pretty-printed.
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Identity under the mixers prefix. Falls back to the hostname.
    pub module_id: String,
    /// Address other processes use to reach RTP on this worker.
    pub advertise_host: String,
    pub port_start: u16,
    pub port_end: u16,
    pub heartbeat_ttl_secs: u64,
    pub capacity: u32,
    pub ffmpeg_binary: String,
    pub soft_stop_timeout_ms: u64,
    pub force_kill_timeout_ms: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            module_id: String::new(),
            advertise_host: "127.0.0.1".to_string(),
            port_start: 20000,
            port_end: 40000,
            heartbeat_ttl_secs: 10,
            capacity: 16,
            ffmpeg_binary: "ffmpeg".to_string(),
            soft_stop_timeout_ms: 1000,
            force_kill_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Interval of the expiry sweep.
    pub tick_interval_secs: u64,
    /// A user with no update for this long is no longer active.
    pub user_timeout_secs: u64,
    /// Consumer name within the status group; defaults to the server id.
    pub consumer_name: String,
    /// Mailbox capacity of the status actor.
    pub mailbox_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            user_timeout_secs: 30,
            consumer_name: String::new(),
            mailbox_capacity: 100,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Hex-encoded 32-byte key sealing media-session resume tokens.
    pub resume_key_hex: String,
    /// TTL of the per-user single-session guard.
    pub session_guard_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            resume_key_hex: String::new(),
            session_guard_ttl_secs: 30,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("resume_key_hex", &"<redacted>")
            .field("session_guard_ttl_secs", &self.session_guard_ttl_secs)
            .finish()
    }
}

impl GatewayConfig {
    pub fn resume_key(&self) -> Result<Vec<u8>> {
        hex::decode(&self.resume_key_hex)
            .map_err(|e| Error::Internal(format!("Invalid resume key: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.presence.tick_interval_secs, 10);
        assert_eq!(config.presence.user_timeout_secs, 30);
        assert_eq!(config.mixer.port_start, 20000);
        assert!(config.mixer.port_start < config.mixer.port_end);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = Config::default();
        config.token.secret = "super-secret".to_string();
        config.gateway.resume_key_hex = "deadbeef".to_string();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("deadbeef"));
    }

    #[test]
    fn test_algorithm_parse() {
        let mut token = TokenConfig::default();
        assert!(token.parse_algorithm().is_ok());
        token.algorithm = "HS384".to_string();
        assert_eq!(
            token.parse_algorithm().unwrap(),
            jsonwebtoken::Algorithm::HS384
        );
        token.algorithm = "none".to_string();
        assert!(token.parse_algorithm().is_err());
    }
}
