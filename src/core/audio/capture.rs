//! Microphone capture.
//!
//! A device pushes raw sample chunks of whatever size it produces into a
//! channel. [`AudioRecorder`] re-frames them into fixed blocks and hands each
//! full block to the registered callback.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AudioError, DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_RATE};

/// Callback invoked with every full block of captured samples.
pub type BlockCallback = Arc<dyn Fn(Vec<f32>) + Send + Sync>;

/// Capture stream parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 24000)
    pub sample_rate: u32,
    /// Channel count (default: 1)
    pub channels: u16,
    /// Samples per emitted block (default: 4096)
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// An open OS-level capture stream.
pub trait CaptureHandle: Send {
    /// Release the underlying device. Must take effect before returning.
    fn close(&mut self);
}

/// A source of captured audio.
pub trait AudioInputDevice: Send + Sync {
    /// Open a capture stream that pushes raw chunks into `sink`.
    ///
    /// # Errors
    /// * `AudioError::Permission` if access to the device is denied
    /// * `AudioError::Device` if no usable device exists
    fn open(
        &self,
        config: &CaptureConfig,
        sink: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureHandle>, AudioError>;
}

/// Accumulates arbitrary chunks into fixed-size blocks.
#[derive(Debug)]
pub struct BlockFramer {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockFramer {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Add a chunk and return every block it completes.
    pub fn push(&mut self, mut chunk: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        while !chunk.is_empty() {
            let wanted = self.block_size - self.pending.len();
            let take = wanted.min(chunk.len());
            self.pending.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.pending.len() == self.block_size {
                let block =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                blocks.push(block);
            }
        }
        blocks
    }

    /// Samples waiting for a block to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Owns one live capture stream.
///
/// Each call to [`AudioRecorder::start`] opens a fresh stream on the device;
/// the recorder is the only owner of that stream's handle.
pub struct AudioRecorder {
    device: Arc<dyn AudioInputDevice>,
    config: CaptureConfig,
    handle: Option<Box<dyn CaptureHandle>>,
    framer_task: Option<JoinHandle<()>>,
}

impl AudioRecorder {
    pub fn new(device: Arc<dyn AudioInputDevice>, config: CaptureConfig) -> Self {
        Self {
            device,
            config,
            handle: None,
            framer_task: None,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the device and start delivering blocks to `on_block`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, on_block: BlockCallback) -> Result<(), AudioError> {
        if self.is_active() {
            return Err(AudioError::AlreadyActive);
        }

        let (sink, mut chunks) = mpsc::unbounded_channel::<Vec<f32>>();
        let handle = self.device.open(&self.config, sink)?;

        let block_size = self.config.block_size;
        let framer_task = tokio::spawn(async move {
            let mut framer = BlockFramer::new(block_size);
            while let Some(chunk) = chunks.recv().await {
                for block in framer.push(&chunk) {
                    on_block(block);
                }
            }
            if framer.pending_len() > 0 {
                debug!(
                    samples = framer.pending_len(),
                    "Discarding partial capture block"
                );
            }
        });

        self.handle = Some(handle);
        self.framer_task = Some(framer_task);
        info!(
            sample_rate = self.config.sample_rate,
            block_size = self.config.block_size,
            "Audio capture started"
        );
        Ok(())
    }

    /// Stop capturing. Safe to call when not started.
    ///
    /// The device handle is closed before this returns.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            info!("Audio capture stopped");
        }
        if let Some(task) = self.framer_task.take() {
            task.abort();
        }
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// In-process capture device
// =============================================================================

#[derive(Default)]
struct ChannelDeviceState {
    sink: Option<mpsc::UnboundedSender<Vec<f32>>>,
    permission_denied: bool,
    unavailable: bool,
    opened: usize,
}

/// Capture device fed from inside the process.
///
/// Useful for embedding the engine behind another audio stack and for tests.
/// Only one stream may be open at a time.
#[derive(Clone, Default)]
pub struct ChannelInputDevice {
    state: Arc<Mutex<ChannelDeviceState>>,
}

/// Producer side of a [`ChannelInputDevice`].
#[derive(Clone)]
pub struct ChannelFeed {
    state: Arc<Mutex<ChannelDeviceState>>,
}

impl ChannelInputDevice {
    pub fn new() -> (Self, ChannelFeed) {
        let device = Self::default();
        let feed = ChannelFeed {
            state: device.state.clone(),
        };
        (device, feed)
    }

    /// Make every subsequent open fail with a permission error.
    pub fn deny_permission(&self, denied: bool) {
        self.state.lock().permission_denied = denied;
    }

    /// Make every subsequent open fail as if no device were present.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }
}

impl AudioInputDevice for ChannelInputDevice {
    fn open(
        &self,
        _config: &CaptureConfig,
        sink: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureHandle>, AudioError> {
        let mut state = self.state.lock();
        if state.permission_denied {
            return Err(AudioError::Permission(
                "capture access was denied".to_string(),
            ));
        }
        if state.unavailable {
            return Err(AudioError::Device("no capture device available".to_string()));
        }
        if state.sink.is_some() {
            return Err(AudioError::Device("capture device is busy".to_string()));
        }
        state.sink = Some(sink);
        state.opened += 1;
        Ok(Box::new(ChannelCaptureHandle {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct ChannelCaptureHandle {
    state: Arc<Mutex<ChannelDeviceState>>,
    closed: bool,
}

impl CaptureHandle for ChannelCaptureHandle {
    fn close(&mut self) {
        if !self.closed {
            self.state.lock().sink = None;
            self.closed = true;
        }
    }
}

impl Drop for ChannelCaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelFeed {
    /// Push a chunk of samples. Returns false when no stream is open.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let state = self.state.lock();
        match &state.sink {
            Some(sink) => {
                if sink.send(samples).is_err() {
                    warn!("Capture stream receiver is gone");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Whether a capture stream currently holds the device.
    pub fn is_open(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    /// Number of streams opened on the device so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }
}
