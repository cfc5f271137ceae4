use std::sync::atomic::{AtomicBool, Ordering};
use log::debug;
use serde::Serialize;

/// Default mean-amplitude threshold above which a frame counts as speech
pub const DEFAULT_ACTIVITY_THRESHOLD: f32 = 0.01;

/// Mean absolute amplitude of a frame
pub fn calculate_mean_amplitude(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Per-frame speech detector based on mean absolute amplitude
#[derive(Debug, Clone, Copy)]
pub struct ActivityDetector {
    threshold: f32,
}

impl ActivityDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_speech(&self, samples: &[f32]) -> bool {
        calculate_mean_amplitude(samples) > self.threshold
    }
}

impl Default for ActivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_THRESHOLD)
    }
}

/// Who is currently talking. The two flags are independent.
#[derive(Debug, Default)]
pub struct ActivityState {
    user_speaking: AtomicBool,
    agent_speaking: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ActivitySnapshot {
    pub user_speaking: bool,
    pub agent_speaking: bool,
}

impl ActivityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the flag changed
    pub fn set_user_speaking(&self, speaking: bool) -> bool {
        let previous = self.user_speaking.swap(speaking, Ordering::AcqRel);
        if previous != speaking {
            debug!("User speaking: {}", speaking);
        }
        previous != speaking
    }

    /// Returns true when the flag changed
    pub fn set_agent_speaking(&self, speaking: bool) -> bool {
        let previous = self.agent_speaking.swap(speaking, Ordering::AcqRel);
        if previous != speaking {
            debug!("Agent speaking: {}", speaking);
        }
        previous != speaking
    }

    pub fn user_speaking(&self) -> bool {
        self.user_speaking.load(Ordering::Acquire)
    }

    pub fn agent_speaking(&self) -> bool {
        self.agent_speaking.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            user_speaking: self.user_speaking(),
            agent_speaking: self.agent_speaking(),
        }
    }

    pub fn reset(&self) {
        self.set_user_speaking(false);
        self.set_agent_speaking(false);
    }
}
