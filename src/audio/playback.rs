use std::collections::BTreeMap;
use std::sync::Arc;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::mpsc;

use super::activity::ActivityState;
use super::device::{BufferId, OutputDevice, OutputHandle};
use super::encode::decode_pcm16;
use super::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Scheduled,
    Playing,
    Finished,
}

/// A decoded chunk placed on the output clock
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackBuffer {
    pub id: BufferId,
    pub start_at: f64,
    pub duration: f64,
    pub state: PlaybackState,
}

impl PlaybackBuffer {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Places inbound agent audio back to back on the output clock.
///
/// Each chunk starts at `max(clock.now(), end of the previous chunk)`, so
/// playback is gapless while audio keeps arriving and never overlaps or
/// reorders. An interruption cancels everything in flight and pulls the
/// cursor back to the clock.
pub struct PlaybackScheduler {
    output: Option<(Arc<dyn OutputDevice>, OutputHandle)>,
    sample_rate: u32,
    active: BTreeMap<BufferId, PlaybackBuffer>,
    last_scheduled_end: f64,
    next_id: BufferId,
    activity: Arc<ActivityState>,
    completions: mpsc::UnboundedSender<BufferId>,
}

impl PlaybackScheduler {
    /// The receiver yields ids of buffers that finished playing; feed them
    /// back through [`PlaybackScheduler::on_buffer_finished`].
    pub fn new(sample_rate: u32, activity: Arc<ActivityState>) -> (Self, mpsc::UnboundedReceiver<BufferId>) {
        let (completions, finished) = mpsc::unbounded_channel();
        let scheduler = Self {
            output: None,
            sample_rate,
            active: BTreeMap::new(),
            last_scheduled_end: 0.0,
            next_id: 0,
            activity,
            completions,
        };
        (scheduler, finished)
    }

    pub fn attach_output(&mut self, output: Arc<dyn OutputDevice>, handle: OutputHandle) {
        self.last_scheduled_end = output.now();
        self.output = Some((output, handle));
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Decode a chunk and schedule it. A decode error leaves every piece of
    /// scheduling state untouched.
    pub fn enqueue_chunk(&mut self, chunk: &[u8]) -> Result<PlaybackBuffer, AudioError> {
        let (output, _) = self.output.clone()
            .ok_or_else(|| AudioError::output_failed("no output device attached"))?;

        let samples = decode_pcm16(chunk)?;
        let duration = samples.len() as f64 / self.sample_rate as f64;

        let now = output.now();
        self.refresh_states(now);
        let requested = now.max(self.last_scheduled_end);

        let id = self.next_id;
        self.next_id += 1;

        let completions = self.completions.clone();
        // The device may start later than requested if its clock moved on
        let start_at = output.schedule(
            id,
            samples.into(),
            self.sample_rate,
            requested,
            Box::new(move || {
                let _ = completions.send(id);
            }),
        )?;

        self.last_scheduled_end = start_at + duration;
        let buffer = PlaybackBuffer {
            id,
            start_at,
            duration,
            state: if start_at <= now { PlaybackState::Playing } else { PlaybackState::Scheduled },
        };
        self.active.insert(id, buffer.clone());
        self.activity.set_agent_speaking(true);

        debug!("Scheduled buffer {} at {:.3}s for {:.3}s ({} active)", id, start_at, duration, self.active.len());
        Ok(buffer)
    }

    /// Completion from the output device. Returns false for buffers that were
    /// already flushed.
    pub fn on_buffer_finished(&mut self, id: BufferId) -> bool {
        match self.active.remove(&id) {
            Some(mut buffer) => {
                buffer.state = PlaybackState::Finished;
                debug!("Buffer {} finished at {:.3}s", id, buffer.end_at());
                if self.active.is_empty() {
                    self.activity.set_agent_speaking(false);
                }
                true
            }
            None => false,
        }
    }

    /// Barge-in: stop every active buffer and restart the cursor at the clock
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.flush();
        info!("Playback interrupted, {} buffers discarded", stopped);
        stopped
    }

    /// Cancel and forget every active buffer, whatever its state
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        if let Some((output, _)) = self.output.as_ref() {
            for id in self.active.keys() {
                output.cancel(*id);
            }
            self.last_scheduled_end = output.now();
        }
        self.active.clear();
        self.activity.set_agent_speaking(false);
        stopped
    }

    /// Drop the output device reference after asking it to release
    pub fn release_output(&mut self) {
        if let Some((output, handle)) = self.output.take() {
            output.release(handle);
        }
    }

    /// Promote buffers whose start time has passed to `Playing`
    pub fn refresh_states(&mut self, now: f64) {
        for buffer in self.active.values_mut() {
            if buffer.state == PlaybackState::Scheduled && buffer.start_at <= now {
                buffer.state = PlaybackState::Playing;
            }
        }
    }

    pub fn buffer(&self, id: BufferId) -> Option<&PlaybackBuffer> {
        self.active.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn last_scheduled_end(&self) -> f64 {
        self.last_scheduled_end
    }
}
