use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::error::AudioError;

/// Sample format carried alongside every encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn mono(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1 }
    }

    /// MIME type understood by the agent, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    pub fn duration_secs(&self, samples: usize) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        samples as f64 / (self.sample_rate as f64 * self.channels as f64)
    }
}

/// Little-endian 16-bit PCM ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub format: PcmFormat,
    /// Position of the frame in capture order
    pub sequence: u64,
}

impl EncodedFrame {
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Convert one float sample to signed 16-bit, clamping to [-1, 1] first.
pub fn float_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled.round() as i16
}

pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(float_to_i16(sample));
    }
    buf.freeze()
}

/// Decode little-endian 16-bit PCM into floats in [-1, 1).
pub fn decode_pcm16(data: &[u8]) -> Result<Vec<f32>, AudioError> {
    if data.is_empty() {
        return Err(AudioError::decode_failed(0, "empty chunk"));
    }
    if data.len() % 2 != 0 {
        return Err(AudioError::decode_failed(data.len(), "odd number of bytes for 16-bit PCM"));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}
