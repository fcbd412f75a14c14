//! Mixer worker: converges local FFmpeg pipelines to the broadcast state
//! observed in the coordination store.

pub mod controller;
pub mod pipeline;
pub mod ports;
pub mod worker;

pub use controller::{plan, ActiveLocalRoom, ConvergeAction, MixerController};
pub use pipeline::{AudioPipeline, FfmpegPipeline};
pub use worker::MixerWorker;
