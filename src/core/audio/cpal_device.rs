//! Capture and playback on the platform audio host through `cpal`.
//!
//! A `cpal::Stream` is not `Send`, so each stream is built, played and dropped
//! on a thread of its own. Handles talk to that thread over std channels.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, Host, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::convert::{downmix_to_mono, resample_linear};
use super::{
    AudioError, AudioInputDevice, AudioOutput, CaptureConfig, CaptureHandle, PlaybackBuffer,
};

const PERMISSION_HINTS: [&str; 4] = ["permission", "denied", "not permitted", "access"];

fn classify(context: &str, err: impl std::fmt::Display) -> AudioError {
    let message = format!("{context}: {err}");
    let lower = message.to_lowercase();
    if PERMISSION_HINTS.iter().any(|hint| lower.contains(hint)) {
        AudioError::Permission(message)
    } else {
        AudioError::Device(message)
    }
}

macro_rules! audio_error_from {
    ($($err:ty => $context:literal),* $(,)?) => {
        $(
            impl From<$err> for AudioError {
                fn from(err: $err) -> Self {
                    classify($context, err)
                }
            }
        )*
    };
}

audio_error_from! {
    cpal::DevicesError => "listing audio devices",
    cpal::SupportedStreamConfigsError => "querying stream formats",
    cpal::DefaultStreamConfigError => "querying default stream format",
    cpal::BuildStreamError => "opening audio stream",
    cpal::PlayStreamError => "starting audio stream",
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

fn find_device(
    host: &Host,
    name: Option<&str>,
    direction: Direction,
) -> Result<Device, AudioError> {
    let Some(name) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| {
            AudioError::Device(format!("no default {} device", direction.as_str()))
        });
    };

    let mut devices: Box<dyn Iterator<Item = Device>> = match direction {
        Direction::Input => Box::new(host.input_devices()?),
        Direction::Output => Box::new(host.output_devices()?),
    };
    devices
        .find(|device| device.name().is_ok_and(|n| n == name))
        .ok_or_else(|| {
            AudioError::Device(format!("{} device '{name}' not found", direction.as_str()))
        })
}

/// Prefer an f32 format that runs at `sample_rate` natively, fewest channels
/// first. Otherwise fall back to the device default and convert in software.
fn pick_config(
    supported: impl Iterator<Item = SupportedStreamConfigRange>,
    default: impl FnOnce() -> Result<SupportedStreamConfig, cpal::DefaultStreamConfigError>,
    sample_rate: u32,
) -> Result<StreamConfig, AudioError> {
    let native = supported
        .filter(|range| {
            range.sample_format() == SampleFormat::F32
                && range.min_sample_rate().0 <= sample_rate
                && range.max_sample_rate().0 >= sample_rate
        })
        .min_by_key(|range| range.channels());
    if let Some(range) = native {
        return Ok(range.with_sample_rate(SampleRate(sample_rate)).config());
    }

    let fallback = default()?;
    if fallback.sample_format() != SampleFormat::F32 {
        warn!(format = ?fallback.sample_format(), "Device default format is not f32");
    }
    Ok(fallback.config())
}

/// Names of the capture devices on the default host.
pub fn input_device_names() -> Result<Vec<String>, AudioError> {
    let host = cpal::default_host();
    Ok(host
        .input_devices()?
        .filter_map(|device| device.name().ok())
        .collect())
}

// =============================================================================
// Capture
// =============================================================================

/// Microphone capture through the default `cpal` host.
///
/// Whatever the device runs at, chunks reach the sink as mono samples at the
/// configured rate.
#[derive(Debug, Clone, Default)]
pub struct CpalInputDevice {
    device_name: Option<String>,
}

impl CpalInputDevice {
    /// Capture from the host's default input device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture from the input device with this exact name.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    config: &CaptureConfig,
    sink: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name, Direction::Input)?;
    let stream_config = pick_config(
        device.supported_input_configs()?,
        || device.default_input_config(),
        config.sample_rate,
    )?;

    let channels = stream_config.channels;
    let device_rate = stream_config.sample_rate.0;
    let target_rate = config.sample_rate;
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono = downmix_to_mono(data, channels);
            let _ = sink.send(resample_linear(&mono, device_rate, target_rate));
        },
        |err| error!("Audio input stream error: {}", err),
        None,
    )?;
    stream.play()?;

    info!(device_rate, channels, target_rate, "Native audio capture opened");
    Ok(stream)
}

impl AudioInputDevice for CpalInputDevice {
    fn open(
        &self,
        config: &CaptureConfig,
        sink: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureHandle>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name("waav-audio-input".to_string())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), &config, sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Native audio capture stream dropped");
            })
            .map_err(|e| AudioError::Device(format!("spawning capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalCaptureHandle {
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Device("capture thread exited early".to_string()))
            }
        }
    }
}

struct CpalCaptureHandle {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    /// Drops the stream and waits for its thread, so the device is released
    /// before this returns.
    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio capture thread panicked");
            }
        }
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Playback
// =============================================================================

#[derive(Default)]
struct OutputQueue {
    samples: VecDeque<f32>,
    drained: Option<oneshot::Sender<()>>,
}

/// Render callback body: one queued mono sample per frame, silence after.
fn fill_output(queue: &Mutex<OutputQueue>, data: &mut [f32], channels: usize) {
    let Some(mut queue) = queue.try_lock() else {
        data.fill(0.0);
        return;
    };
    for frame in data.chunks_mut(channels.max(1)) {
        let sample = queue.samples.pop_front().unwrap_or(0.0);
        frame.fill(sample);
    }
    if queue.samples.is_empty() {
        if let Some(drained) = queue.drained.take() {
            let _ = drained.send(());
        }
    }
}

struct OutputStream {
    sample_rate: u32,
    failed: Arc<AtomicBool>,
    stop: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream {
    fn open(
        device_name: Option<String>,
        wanted_rate: u32,
        queue: Arc<Mutex<OutputQueue>>,
    ) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop, stop_rx) = std_mpsc::channel::<()>();
        let failed = Arc::new(AtomicBool::new(false));
        let stream_failed = failed.clone();

        let thread = std::thread::Builder::new()
            .name("waav-audio-output".to_string())
            .spawn(move || {
                let built =
                    build_output_stream(device_name.as_deref(), wanted_rate, queue, stream_failed);
                let (stream, sample_rate) = match built {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sample_rate));
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Native audio output stream dropped");
            })
            .map_err(|e| AudioError::Device(format!("spawning output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Self {
                sample_rate,
                failed,
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Device("output thread exited early".to_string()))
            }
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
    }
}

fn build_output_stream(
    device_name: Option<&str>,
    wanted_rate: u32,
    queue: Arc<Mutex<OutputQueue>>,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name, Direction::Output)?;
    let stream_config = pick_config(
        device.supported_output_configs()?,
        || device.default_output_config(),
        wanted_rate,
    )?;

    let channels = usize::from(stream_config.channels);
    let sample_rate = stream_config.sample_rate.0;
    let render_queue = queue.clone();
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            fill_output(&render_queue, data, channels);
        },
        move |err| {
            error!("Audio output stream error: {}", err);
            failed.store(true, Ordering::SeqCst);
            // Wakes a pending play() with an error instead of leaving it hanging
            let mut queue = queue.lock();
            queue.samples.clear();
            queue.drained = None;
        },
        None,
    )?;
    stream.play()?;

    info!(sample_rate, channels, "Native audio output opened");
    Ok((stream, sample_rate))
}

/// Speaker output through the default `cpal` host.
///
/// The stream is opened on [`AudioOutput::prepare`] or the first `play`, and
/// reopened if the host reports a stream error.
pub struct CpalOutput {
    device_name: Option<String>,
    sample_rate: u32,
    queue: Arc<Mutex<OutputQueue>>,
    stream: Mutex<Option<OutputStream>>,
}

impl CpalOutput {
    /// Play on the host's default output device, preferring `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            device_name: None,
            sample_rate,
            queue: Arc::new(Mutex::new(OutputQueue::default())),
            stream: Mutex::new(None),
        }
    }

    /// Play on the output device with this exact name.
    pub fn with_device(name: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            device_name: Some(name.into()),
            ..Self::new(sample_rate)
        }
    }

    /// Open the stream if needed and return its rate.
    fn ensure_stream(&self) -> Result<u32, AudioError> {
        let mut slot = self.stream.lock();
        match slot.as_ref() {
            Some(stream) if !stream.failed.load(Ordering::SeqCst) => {
                return Ok(stream.sample_rate);
            }
            Some(_) => warn!("Audio output stream failed, reopening"),
            None => {}
        }
        // The old stream's thread is joined before the new one opens
        *slot = None;
        let stream = OutputStream::open(
            self.device_name.clone(),
            self.sample_rate,
            self.queue.clone(),
        )?;
        let sample_rate = stream.sample_rate;
        *slot = Some(stream);
        Ok(sample_rate)
    }
}

struct SilenceOnDrop(Arc<Mutex<OutputQueue>>);

impl Drop for SilenceOnDrop {
    fn drop(&mut self) {
        let mut queue = self.0.lock();
        queue.samples.clear();
        queue.drained = None;
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    fn prepare(&self) -> Result<(), AudioError> {
        self.ensure_stream().map(|_| ())
    }

    async fn play(&self, buffer: &PlaybackBuffer) -> Result<(), AudioError> {
        if buffer.samples.is_empty() {
            return Ok(());
        }
        let device_rate = self.ensure_stream()?;
        let samples = resample_linear(&buffer.samples, buffer.sample_rate, device_rate);

        let (drained_tx, drained_rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            queue.samples.clear();
            queue.samples.extend(samples);
            queue.drained = Some(drained_tx);
        }
        let _silence = SilenceOnDrop(self.queue.clone());

        drained_rx.await.map_err(|_| {
            AudioError::Output("output stream stopped before the buffer drained".to_string())
        })
    }
}
