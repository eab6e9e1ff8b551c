//! # Tale Voice - Live Voice Storyteller Session Core
//!
//! Streams the microphone to a live speech-to-speech storyteller service,
//! plays its spoken replies back gaplessly, fires sound effects on request
//! and keeps a running transcript.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Voice Orchestrator                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │   Audio In   │→ │  PCM Codec   │→ │   Session    │     │
//! │  │    (cpal)    │  │ (base64 i16) │  │  (websocket) │     │
//! │  └──────────────┘  └──────────────┘  └──────────────┘     │
//! │                                              ↓              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │  Audio Out   │← │  Scheduler   │← │ Event Router │     │
//! │  │   (rodio)    │  │  (gapless)   │  │ (status FSM) │     │
//! │  └──────────────┘  └──────────────┘  └──────────────┘     │
//! │         ↑                                    ↓              │
//! │  ┌──────────────┐                    ┌──────────────┐     │
//! │  │  Sound Bank  │←── tool calls ─────│  Transcript  │     │
//! │  └──────────────┘                    └──────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod channel;
pub mod codec;
pub mod config;
pub mod effects;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod protocol;
pub mod transcript;

pub use audio::{
    AudioCapture, AudioChunk, AudioDevices, CaptureConfig, CaptureStream, MonoResampler,
    OutputSink, PlaybackConfig, PlaybackId, RodioSink, SystemAudio,
};
pub use channel::{ChannelPeer, Connector, HandleState, SessionChannel, SessionHandle, WebSocketConnector};
pub use codec::{bytes_to_transport_text, pcm16_to_samples, samples_to_pcm16, transport_text_to_bytes, PcmBuffer};
pub use config::{LiveConfig, SessionSetup};
pub use effects::{SoundBank, SoundEffect};
pub use error::{FailureKind, VoiceError, VoiceResult};
pub use orchestrator::{OrchestratorConfig, SessionEvent, Status, VoiceOrchestrator};
pub use playback::{Completion, PlaybackScheduler, ScheduledFragment};
pub use protocol::{AudioFragment, ChannelEvent, ClientMessage, FunctionCall, FunctionResponse, MediaChunk};
pub use transcript::{Conversation, Speaker, Turn, TurnSummary};
