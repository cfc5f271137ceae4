//! Capabilities the engine needs from the audio hardware.
//!
//! The session only ever talks to these traits; `core` provides the cpal
//! backed implementations and the test suite provides counting fakes.

use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::AudioError;

/// One capture callback's worth of mono samples
pub type AudioFrame = Vec<f32>;

/// Identifies a buffer handed to an output device
pub type BufferId = u64;

/// Fired by the output device once a scheduled buffer has played out
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Live microphone stream returned by [`CaptureDevice::acquire`].
///
/// Must be handed back through [`CaptureDevice::release`]; dropping it only
/// closes the frame channel.
#[derive(Debug)]
pub struct FrameStream {
    id: u64,
    sample_rate: u32,
    frame_size: usize,
    frames: mpsc::Receiver<AudioFrame>,
}

impl FrameStream {
    pub fn new(id: u64, sample_rate: u32, frame_size: usize, frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self { id, sample_rate, frame_size, frames }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Next frame in capture order, `None` once the device stopped delivering
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

/// Claim on an output device returned by [`OutputDevice::acquire`].
///
/// Releasing a handle only ever affects the acquisition that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputHandle {
    id: u64,
}

impl OutputHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open the microphone and start delivering `frame_size` frames at `sample_rate`
    async fn acquire(&self, sample_rate: u32, frame_size: usize) -> Result<FrameStream, AudioError>;

    fn release(&self, stream: FrameStream);
}

/// Speaker side of a session.
///
/// At most one acquisition is active. A newer `acquire` supersedes any
/// acquisition still held or still starting, so a late acquisition left
/// over from a torn-down session can never displace the live one.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    async fn acquire(&self, sample_rate: u32) -> Result<OutputHandle, AudioError>;

    /// Monotonic output clock in seconds
    fn now(&self) -> f64;

    /// Play `samples` starting at `start_at` on the output clock.
    ///
    /// Returns the start actually used, which is later than `start_at` when
    /// the clock moved past it before the buffer was placed.
    fn schedule(
        &self,
        id: BufferId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_at: f64,
        on_finished: CompletionCallback,
    ) -> Result<f64, AudioError>;

    /// Stop a buffer immediately. Its completion callback is dropped unfired.
    fn cancel(&self, id: BufferId);

    /// Release one acquisition. Stale or superseded handles are ignored.
    fn release(&self, handle: OutputHandle);
}
