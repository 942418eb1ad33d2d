//! Local audio engine.
//!
//! Capture and playback sit behind small device traits so the engine can be
//! driven by a real audio backend or by the in-process devices shipped here:
//!
//! - [`AudioRecorder`] frames a live capture stream into fixed-size blocks
//! - [`PlaybackQueue`] plays decoded buffers strictly one after another
//!
//! With the `native-audio` feature, [`CpalInputDevice`] and [`CpalOutput`]
//! drive the platform audio host through `cpal`.

mod capture;
mod convert;
#[cfg(feature = "native-audio")]
mod cpal_device;
mod playback;

pub use capture::{
    AudioInputDevice, AudioRecorder, BlockCallback, BlockFramer, CaptureConfig, CaptureHandle,
    ChannelFeed, ChannelInputDevice,
};
pub use convert::{downmix_to_mono, resample_linear};
#[cfg(feature = "native-audio")]
pub use cpal_device::{CpalInputDevice, CpalOutput, input_device_names};
pub use playback::{
    AudioOutput, PlaybackBuffer, PlaybackEvent, PlaybackQueue, SimulatedOutput,
};

use thiserror::Error;

use crate::core::codec::CodecError;

/// Sample rate used on both sides of the realtime link.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Local audio failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AudioError {
    #[error("Microphone permission denied: {0}")]
    Permission(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio capture is already active")]
    AlreadyActive,
    #[error("Audio format error: {0}")]
    Format(#[from] CodecError),
    #[error("Audio output error: {0}")]
    Output(String),
}
