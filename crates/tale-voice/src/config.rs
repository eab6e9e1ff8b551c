//! Session and connection configuration.
//!
//! Defaults are usable as-is; `from_env` variants let the demo (and any host
//! app) override them from the environment or a `.env` file.

use crate::effects::SoundEffect;
use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;

/// Live websocket endpoint (API key is appended as `?key=`).
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const DEFAULT_VOICE: &str = "Puck";

const PERSONA: &str = "You are a warm, playful storyteller for children. \
Tell short, vivid stories and invite the listener to help decide what happens next. \
Speak in simple sentences and pause often so the listener can join in. \
When a moment in the story calls for it, call the playSoundEffect tool with one of these sounds";

/// What the remote session is told at connect time.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub model: String,
    /// Prebuilt voice identity for spoken responses.
    pub voice: String,
    pub persona: String,
    /// Effects the model is allowed to request.
    pub sound_effects: Vec<SoundEffect>,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            persona: PERSONA.to_string(),
            sound_effects: SoundEffect::ALL.to_vec(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

impl SessionSetup {
    /// Defaults with `TALE_MODEL` / `TALE_VOICE` overrides.
    pub fn from_env() -> Self {
        let mut setup = Self::default();
        if let Ok(model) = std::env::var("TALE_MODEL") {
            if !model.trim().is_empty() {
                setup.model = model.trim().to_string();
            }
        }
        if let Ok(voice) = std::env::var("TALE_VOICE") {
            if !voice.trim().is_empty() {
                setup.voice = voice.trim().to_string();
            }
        }
        setup
    }

    /// Persona followed by the permitted effect names.
    pub fn system_prompt(&self) -> String {
        let names: Vec<&str> = self.sound_effects.iter().map(|e| e.name()).collect();
        format!("{}: {}.", self.persona, names.join(", "))
    }
}

/// Where and how to reach the live service.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Bound on websocket handshake plus setup acknowledgment.
    pub connect_timeout: Duration,
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Build from environment: TALE_API_KEY (or GEMINI_API_KEY), TALE_ENDPOINT,
    /// TALE_CONNECT_TIMEOUT_SECS.
    pub fn from_env() -> VoiceResult<Self> {
        let api_key = std::env::var("TALE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| VoiceError::Config("Live session requires TALE_API_KEY or GEMINI_API_KEY".to_string()))?;
        let mut config = Self::new(api_key.trim());
        if let Ok(endpoint) = std::env::var("TALE_ENDPOINT") {
            config.endpoint = endpoint.trim().trim_end_matches('?').to_string();
        }
        if let Ok(secs) = std::env::var("TALE_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| VoiceError::Config(format!("Invalid TALE_CONNECT_TIMEOUT_SECS: {}", secs)))?;
            config.connect_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }

    /// Endpoint with the key query parameter.
    pub fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }
}
