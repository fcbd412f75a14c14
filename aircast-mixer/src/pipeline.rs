//! Local audio pipeline supervision.
//!
//! The controller talks to FFmpeg through [`AudioPipeline`] so tests can
//! substitute a mock. The real implementation spawns one FFmpeg process
//! per room, pulling RTP off the allocated port and writing encrypted HLS
//! segments to the room's path.

use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use aircast_core::config::MixerConfig;
use aircast_core::models::RoomId;
use aircast_core::{Error, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioPipeline: Send + Sync + 'static {
    /// Start mixing `room_id` from `rtp_port` into `hls_path`. Restarts
    /// the pipeline if one is already running for the room.
    async fn start(&self, room_id: &RoomId, rtp_port: u16, hls_path: &str) -> Result<()>;

    /// Stop the room's pipeline. Erroring leaves the pipeline considered
    /// running; the next convergence pass retries.
    async fn stop(&self, room_id: &RoomId) -> Result<()>;

    /// Stop everything (process shutdown).
    async fn stop_all(&self) -> Result<()>;
}

/// FFmpeg-backed pipeline.
pub struct FfmpegPipeline {
    binary: String,
    soft_stop_timeout: Duration,
    force_kill_timeout: Duration,
    children: DashMap<RoomId, Child>,
}

impl FfmpegPipeline {
    #[must_use]
    pub fn new(config: &MixerConfig) -> Self {
        Self {
            binary: config.ffmpeg_binary.clone(),
            soft_stop_timeout: Duration::from_millis(config.soft_stop_timeout_ms),
            force_kill_timeout: Duration::from_millis(config.force_kill_timeout_ms),
            children: DashMap::new(),
        }
    }

    fn build_command(&self, rtp_port: u16, hls_path: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("warning")
            .arg("-protocol_whitelist")
            .arg("file,udp,rtp")
            .arg("-i")
            .arg(format!("rtp://0.0.0.0:{rtp_port}"))
            .arg("-c:a")
            .arg("aac")
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg("4")
            .arg("-hls_list_size")
            .arg("6")
            .arg("-hls_flags")
            .arg("delete_segments")
            .arg(format!("{hls_path}/index.m3u8"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Graceful stop: ask FFmpeg to quit via stdin, then kill after the
    /// force window.
    async fn shutdown_child(&self, room_id: &RoomId, mut child: Child) -> Result<()> {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        match tokio::time::timeout(self.soft_stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(room_id = %room_id, status = ?status.code(), "FFmpeg exited");
                return Ok(());
            }
            Ok(Err(e)) => {
                return Err(Error::Internal(format!("FFmpeg wait failed: {e}")));
            }
            Err(_) => {
                tracing::warn!(room_id = %room_id, "FFmpeg ignored quit, killing");
            }
        }

        child
            .start_kill()
            .map_err(|e| Error::Internal(format!("FFmpeg kill failed: {e}")))?;
        match tokio::time::timeout(self.force_kill_timeout, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Internal(format!("FFmpeg wait failed: {e}"))),
            Err(_) => Err(Error::Timeout(format!(
                "FFmpeg for room {room_id} did not die"
            ))),
        }
    }
}

#[async_trait]
impl AudioPipeline for FfmpegPipeline {
    async fn start(&self, room_id: &RoomId, rtp_port: u16, hls_path: &str) -> Result<()> {
        // Convergence retries may land here with a stale child; replace it.
        if let Some((_, old)) = self.children.remove(room_id) {
            tracing::warn!(room_id = %room_id, "Replacing existing pipeline");
            let _ = self.shutdown_child(room_id, old).await;
        }

        let child = self
            .build_command(rtp_port, hls_path)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn FFmpeg: {e}")))?;

        tracing::info!(
            room_id = %room_id,
            rtp_port = rtp_port,
            hls_path = %hls_path,
            "FFmpeg started"
        );
        self.children.insert(room_id.clone(), child);
        Ok(())
    }

    async fn stop(&self, room_id: &RoomId) -> Result<()> {
        let Some((_, child)) = self.children.remove(room_id) else {
            return Ok(());
        };
        match self.shutdown_child(room_id, child).await {
            Ok(()) => {
                tracing::info!(room_id = %room_id, "FFmpeg stopped");
                Ok(())
            }
            Err(e) => {
                // Considered still running; the next pass retries the stop.
                tracing::warn!(room_id = %room_id, error = %e, "FFmpeg stop failed");
                Err(e)
            }
        }
    }

    async fn stop_all(&self) -> Result<()> {
        let rooms: Vec<RoomId> = self.children.iter().map(|e| e.key().clone()).collect();
        for room_id in rooms {
            let _ = self.stop(&room_id).await;
        }
        Ok(())
    }
}
