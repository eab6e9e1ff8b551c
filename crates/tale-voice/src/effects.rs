//! **Sound-effect bank**: short embedded clips the storyteller can trigger
//! mid-story through the `playSoundEffect` tool.
//!
//! Clips are decoded once and replayed as fire-and-forget one-shots. A clip
//! that cannot be played right now is simply skipped.

use crate::audio::OutputSink;
use crate::codec::PcmBuffer;
use crate::error::{VoiceError, VoiceResult};
use rodio::{Decoder, Source};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// The closed set of effects the storyteller may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundEffect {
    Sparkle,
    Thump,
    Whoosh,
}

impl SoundEffect {
    pub const ALL: [SoundEffect; 3] = [SoundEffect::Sparkle, SoundEffect::Thump, SoundEffect::Whoosh];

    pub fn name(self) -> &'static str {
        match self {
            SoundEffect::Sparkle => "sparkle",
            SoundEffect::Thump => "thump",
            SoundEffect::Whoosh => "whoosh",
        }
    }

    /// Embedded WAV bytes (24 kHz mono PCM16).
    pub fn asset(self) -> &'static [u8] {
        match self {
            SoundEffect::Sparkle => include_bytes!("../assets/sparkle.wav"),
            SoundEffect::Thump => include_bytes!("../assets/thump.wav"),
            SoundEffect::Whoosh => include_bytes!("../assets/whoosh.wav"),
        }
    }
}

impl fmt::Display for SoundEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SoundEffect {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SoundEffect::ALL
            .into_iter()
            .find(|effect| effect.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| VoiceError::Protocol(format!("Unknown sound effect: {}", s)))
    }
}

/// Decode a WAV/MP3/etc clip into a buffer.
pub fn decode_clip(bytes: &'static [u8]) -> VoiceResult<PcmBuffer> {
    let decoder = Decoder::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Decode(format!("Clip decode failed: {}", e)))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();
    Ok(PcmBuffer::from_interleaved(sample_rate, channels, &samples))
}

/// Decoded effect clips, keyed by effect.
pub struct SoundBank {
    assets: Vec<(SoundEffect, &'static [u8])>,
    buffers: HashMap<SoundEffect, PcmBuffer>,
}

impl Default for SoundBank {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundBank {
    /// Bank over the embedded clips.
    pub fn new() -> Self {
        Self::with_assets(SoundEffect::ALL.iter().map(|e| (*e, e.asset())).collect())
    }

    /// Bank over caller-supplied clip bytes.
    pub fn with_assets(assets: Vec<(SoundEffect, &'static [u8])>) -> Self {
        Self {
            assets,
            buffers: HashMap::new(),
        }
    }

    /// Decode every clip not decoded yet. Returns how many were newly decoded.
    ///
    /// A clip that fails to decode is logged and retried on the next call.
    pub fn preload(&mut self) -> usize {
        let mut loaded = 0;
        for (effect, bytes) in &self.assets {
            if self.buffers.contains_key(effect) {
                continue;
            }
            match decode_clip(*bytes) {
                Ok(buffer) => {
                    debug!("Sound effect '{}' decoded ({:.2}s)", effect, buffer.duration_secs());
                    self.buffers.insert(*effect, buffer);
                    loaded += 1;
                }
                Err(e) => warn!("Sound effect '{}' failed to load: {}", effect, e),
            }
        }
        if loaded > 0 {
            info!("🔔 Sound bank ready ({}/{} effects)", self.buffers.len(), self.assets.len());
        }
        loaded
    }

    pub fn is_loaded(&self, effect: SoundEffect) -> bool {
        self.buffers.contains_key(&effect)
    }

    /// Fire a one-shot. Returns false (after logging) when the clip is not
    /// preloaded or the sink is not running; nothing is queued for later.
    pub fn play<S>(&self, effect: SoundEffect, sink: Option<&mut S>) -> bool
    where
        S: OutputSink + ?Sized,
    {
        let Some(buffer) = self.buffers.get(&effect) else {
            warn!("Sound effect '{}' not loaded, skipping", effect);
            return false;
        };
        let sink = match sink {
            Some(sink) if sink.is_running() => sink,
            _ => {
                warn!("Output not running, skipping sound effect '{}'", effect);
                return false;
            }
        };
        match sink.play_oneshot(buffer) {
            Ok(()) => {
                info!("✨ Playing sound effect '{}'", effect);
                true
            }
            Err(e) => {
                warn!("Sound effect '{}' playback failed: {}", effect, e);
                false
            }
        }
    }
}
