//! PCM codec: f32 samples ↔ 16-bit little-endian PCM, and raw bytes ↔ base64 text.
//!
//! Everything here is pure and allocation-only. The live service speaks 16-bit
//! signed mono PCM wrapped in base64 inside JSON frames.

use crate::error::VoiceResult;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Scale between normalized f32 samples and i16 PCM.
pub const PCM_SCALE: f32 = 32768.0;

/// Decoded audio: one `Vec<f32>` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    /// Build from de-interleaved channel data. Channels longer than the
    /// shortest one are truncated so every channel has the same frame count.
    pub fn new(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for ch in &mut channels {
            ch.truncate(frames);
        }
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    /// Build from interleaved samples (as produced by rodio decoders).
    pub fn from_interleaved(sample_rate: u32, channel_count: u16, samples: &[f32]) -> Self {
        let count = channel_count.max(1) as usize;
        let frames = samples.len() / count;
        let mut channels = vec![Vec::with_capacity(frames); count];
        for (i, &s) in samples.iter().take(frames * count).enumerate() {
            channels[i % count].push(s);
        }
        Self::new(sample_rate, channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Playback length in seconds (`frame_count / sample_rate`).
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Re-interleave for output devices.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frame_count();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }
}

/// Encode normalized samples as 16-bit little-endian PCM.
///
/// Each sample is scaled by 32768 and truncated toward zero. There is no
/// clamping: values outside [-1, 1) wrap per two's complement, so `1.0`
/// encodes as `-32768`.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let value = (s * PCM_SCALE) as i32 as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM into a de-interleaved, normalized buffer.
///
/// A trailing partial frame (odd byte, or fewer samples than `channel_count`)
/// is ignored.
pub fn pcm16_to_samples(bytes: &[u8], sample_rate: u32, channel_count: u16) -> PcmBuffer {
    let count = channel_count.max(1) as usize;
    let frames = bytes.len() / 2 / count;
    let mut channels = vec![Vec::with_capacity(frames); count];
    for (i, pair) in bytes.chunks_exact(2).take(frames * count).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % count].push(value as f32 / PCM_SCALE);
    }
    PcmBuffer::new(sample_rate, channels)
}

/// Standard base64 (with padding) for embedding bytes in JSON.
pub fn bytes_to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn transport_text_to_bytes(text: &str) -> VoiceResult<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}
