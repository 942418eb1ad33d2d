//! Sequential playback queue.
//!
//! Decoded buffers are appended to a FIFO and played one at a time by a drain
//! task. The next buffer starts only once the output reports the current one
//! finished, so chunks never overlap.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{AudioError, DEFAULT_SAMPLE_RATE};
use crate::core::codec::{self, CodecError};

/// One decoded chunk ready for output.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode PCM16 little-endian bytes.
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32) -> Result<Self, CodecError> {
        let pcm = codec::pcm16_bytes_to_i16(bytes)?;
        Ok(Self::new(codec::pcm16_to_f32(&pcm), sample_rate))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Audio output sink.
///
/// `play` resolves once the buffer has finished playing. Dropping the returned
/// future must stop output immediately.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Open or resume the output ahead of the first buffer.
    fn prepare(&self) -> Result<(), AudioError> {
        Ok(())
    }

    async fn play(&self, buffer: &PlaybackBuffer) -> Result<(), AudioError>;
}

struct QueueInner {
    queue: VecDeque<PlaybackBuffer>,
    drain_task: Option<JoinHandle<()>>,
    generation: u64,
}

/// FIFO of buffers awaiting playback.
///
/// Enqueue never blocks. Unbounded unless `max_queued` is set, in which case
/// the oldest waiting buffer is dropped on overflow.
#[derive(Clone)]
pub struct PlaybackQueue {
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    max_queued: Option<usize>,
    inner: Arc<Mutex<QueueInner>>,
}

impl PlaybackQueue {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self::with_options(output, DEFAULT_SAMPLE_RATE, None)
    }

    pub fn with_options(
        output: Arc<dyn AudioOutput>,
        sample_rate: u32,
        max_queued: Option<usize>,
    ) -> Self {
        Self {
            output,
            sample_rate,
            max_queued,
            inner: Arc::new(Mutex::new(QueueInner {
                queue: VecDeque::new(),
                drain_task: None,
                generation: 0,
            })),
        }
    }

    /// Decode raw PCM16 bytes and queue them.
    pub fn enqueue(&self, pcm_bytes: &[u8]) -> Result<(), CodecError> {
        let buffer = PlaybackBuffer::from_pcm16(pcm_bytes, self.sample_rate)?;
        self.enqueue_buffer(buffer);
        Ok(())
    }

    /// Decode a base64 PCM16 payload and queue it.
    pub fn enqueue_base64(&self, payload: &str) -> Result<(), CodecError> {
        let bytes = codec::decode_bytes(payload)?;
        self.enqueue(&bytes)
    }

    /// Queue an already decoded buffer, starting playback if idle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue_buffer(&self, buffer: PlaybackBuffer) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(buffer);

        if let Some(max) = self.max_queued {
            while inner.queue.len() > max {
                inner.queue.pop_front();
                warn!(max_queued = max, "Playback queue full, dropping oldest buffer");
            }
        }

        if inner.drain_task.is_none() {
            let generation = inner.generation;
            let queue = self.clone();
            inner.drain_task = Some(tokio::spawn(async move {
                queue.drain(generation).await;
            }));
        }
    }

    async fn drain(&self, generation: u64) {
        loop {
            let buffer = {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(buffer) => buffer,
                    None => {
                        inner.drain_task = None;
                        return;
                    }
                }
            };

            debug!(samples = buffer.samples.len(), "Playing buffer");
            if let Err(e) = self.output.play(&buffer).await {
                warn!("Audio output failed: {}", e);
            }
        }
    }

    /// Make sure the output device is usable before any audio arrives.
    pub fn prepare(&self) -> Result<(), AudioError> {
        self.output.prepare()
    }

    /// Stop the current buffer and discard everything queued.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.generation += 1;
        if let Some(task) = inner.drain_task.take() {
            task.abort();
        }
    }

    /// Buffers waiting behind the one currently playing.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether a buffer is playing or waiting to play.
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock();
        inner.drain_task.is_some() || !inner.queue.is_empty()
    }
}

// =============================================================================
// Simulated output
// =============================================================================

/// Notifications emitted by [`SimulatedOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { samples: usize },
    Finished { samples: usize },
}

/// Output that "plays" a buffer by waiting for its duration.
///
/// Used when no audio hardware is attached and in tests.
#[derive(Clone)]
pub struct SimulatedOutput {
    events: mpsc::UnboundedSender<PlaybackEvent>,
    playing: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
}

impl SimulatedOutput {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                playing: Arc::new(AtomicBool::new(false)),
                unavailable: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Make `prepare` and `play` fail as if no output device were present.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AudioError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AudioError::Device("no output device available".to_string()));
        }
        Ok(())
    }

    /// True while a buffer is being output.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

struct PlayingGuard(Arc<AtomicBool>);

impl Drop for PlayingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioOutput for SimulatedOutput {
    fn prepare(&self) -> Result<(), AudioError> {
        self.check_available()
    }

    async fn play(&self, buffer: &PlaybackBuffer) -> Result<(), AudioError> {
        self.check_available()?;
        if self.playing.swap(true, Ordering::SeqCst) {
            return Err(AudioError::Output("output already playing".to_string()));
        }
        let _guard = PlayingGuard(self.playing.clone());
        let samples = buffer.samples.len();
        let _ = self.events.send(PlaybackEvent::Started { samples });
        tokio::time::sleep(buffer.duration()).await;
        let _ = self.events.send(PlaybackEvent::Finished { samples });
        Ok(())
    }
}
