//! Room convergence loop.
//!
//! For every observed room the controller compares three booleans and acts:
//!
//! | should_run | is_running | is_state_runner | action |
//! |---|---|---|---|
//! | T | F | * | start (port, FFmpeg, assignment, local record) |
//! | T | T | F | re-assert own assignment |
//! | T | T | T | nothing |
//! | F | T | T | stop and delete assignment |
//! | F | T | F | stop, leave the other owner's assignment alone |
//! | F | F | * | nothing |
//!
//! `should_run` comes from the room's live metadata naming this mixer,
//! `is_running` from the local room map, `is_state_runner` from the
//! persisted assignment. A foreign assignment while we should run is the
//! split-owner case: we re-assert ours and never delete theirs.

use dashmap::DashMap;
use std::sync::Arc;

use aircast_core::kv::KvStore;
use aircast_core::models::room::subkeys;
use aircast_core::models::{KeyLayout, MixerAssignment, ModuleId, RoomId, RoomState};
use aircast_core::{Error, Result};

use crate::pipeline::AudioPipeline;
use crate::ports::allocate_rtp_port;

/// A room this worker is currently mixing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLocalRoom {
    pub room_id: RoomId,
    pub rtp_port: u16,
    pub status: LocalRoomStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRoomStatus {
    Running,
}

/// Decision of one convergence pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeAction {
    Start,
    SyncAssignment,
    Stop { delete_assignment: bool },
    Nothing,
}

/// The transition table as a pure function.
#[must_use]
pub const fn plan(should_run: bool, is_running: bool, is_state_runner: bool) -> ConvergeAction {
    match (should_run, is_running) {
        (true, false) => ConvergeAction::Start,
        (true, true) => {
            if is_state_runner {
                ConvergeAction::Nothing
            } else {
                ConvergeAction::SyncAssignment
            }
        }
        (false, true) => ConvergeAction::Stop {
            delete_assignment: is_state_runner,
        },
        (false, false) => ConvergeAction::Nothing,
    }
}

pub struct MixerController {
    kv: Arc<dyn KvStore>,
    layout: KeyLayout,
    module_id: ModuleId,
    advertise_host: String,
    port_range: (u16, u16),
    pipeline: Arc<dyn AudioPipeline>,
    active: DashMap<RoomId, ActiveLocalRoom>,
}

impl MixerController {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        layout: KeyLayout,
        module_id: ModuleId,
        advertise_host: String,
        port_range: (u16, u16),
        pipeline: Arc<dyn AudioPipeline>,
    ) -> Self {
        Self {
            kv,
            layout,
            module_id,
            advertise_host,
            port_range,
            pipeline,
            active: DashMap::new(),
        }
    }

    #[must_use]
    pub fn active_room(&self, room_id: &RoomId) -> Option<ActiveLocalRoom> {
        self.active.get(room_id).map(|r| r.clone())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// One convergence pass for one room. Called by the room watcher;
    /// errors propagate so the next observed change retries.
    pub async fn on_room_change(&self, room_id: &RoomId, state: &RoomState) -> Result<()> {
        let should_run = state.desired_mixer() == Some(&self.module_id);
        let is_running = self.active.contains_key(room_id);
        let is_state_runner = state.assigned_mixer() == Some(&self.module_id);

        let action = plan(should_run, is_running, is_state_runner);
        tracing::debug!(
            room_id = %room_id,
            should_run = should_run,
            is_running = is_running,
            is_state_runner = is_state_runner,
            action = ?action,
            "Converging room"
        );

        match action {
            ConvergeAction::Start => self.start_room(room_id, state).await,
            ConvergeAction::SyncAssignment => self.sync_assignment(room_id).await,
            ConvergeAction::Stop { delete_assignment } => {
                self.stop_room(room_id, delete_assignment).await
            }
            ConvergeAction::Nothing => Ok(()),
        }
    }

    async fn start_room(&self, room_id: &RoomId, state: &RoomState) -> Result<()> {
        let rtp_port = allocate_rtp_port(self.port_range.0, self.port_range.1)?;
        let hls_path = state
            .meta
            .as_ref()
            .map_or_else(|| format!("/hls/rooms/{room_id}"), |m| m.hls_path.clone());

        self.pipeline.start(room_id, rtp_port, &hls_path).await?;

        // Assignment write comes after the pipeline: if it fails, FFmpeg
        // keeps running and the next observed change converges.
        self.write_assignment(room_id, rtp_port).await?;

        self.active.insert(
            room_id.clone(),
            ActiveLocalRoom {
                room_id: room_id.clone(),
                rtp_port,
                status: LocalRoomStatus::Running,
            },
        );
        tracing::info!(room_id = %room_id, rtp_port = rtp_port, "Room started");
        Ok(())
    }

    /// Someone else persisted their assignment while the live metadata
    /// names us: write ours back. Never delete the other mixer's record.
    async fn sync_assignment(&self, room_id: &RoomId) -> Result<()> {
        let rtp_port = self
            .active
            .get(room_id)
            .map(|r| r.rtp_port)
            .ok_or_else(|| Error::Internal(format!("No local room for {room_id}")))?;
        tracing::warn!(room_id = %room_id, "Re-asserting mixer assignment");
        self.write_assignment(room_id, rtp_port).await
    }

    async fn stop_room(&self, room_id: &RoomId, delete_assignment: bool) -> Result<()> {
        // A stop failure keeps the local record and the assignment so the
        // next pass retries.
        self.pipeline.stop(room_id).await?;
        self.active.remove(room_id);

        if delete_assignment {
            self.kv
                .delete(&self.layout.room_subkey(room_id, subkeys::MIXER), false)
                .await?;
        }
        tracing::info!(room_id = %room_id, deleted_assignment = delete_assignment, "Room stopped");
        Ok(())
    }

    async fn write_assignment(&self, room_id: &RoomId, rtp_port: u16) -> Result<()> {
        let assignment = MixerAssignment {
            id: self.module_id.clone(),
            ip: self.advertise_host.clone(),
            port: rtp_port,
        };
        self.kv
            .put(
                &self.layout.room_subkey(room_id, subkeys::MIXER),
                serde_json::to_vec(&assignment)?,
                None,
            )
            .await
    }

    /// Process shutdown: stop every local pipeline.
    pub async fn shutdown(&self) {
        if let Err(e) = self.pipeline.stop_all().await {
            tracing::warn!(error = %e, "Pipeline shutdown incomplete");
        }
        self.active.clear();
    }
}
