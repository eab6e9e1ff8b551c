//! Wire messages exchanged with the live storyteller service.
//!
//! Outbound frames are externally tagged JSON objects (`{"media": {...}}`,
//! `{"functionResponses": {...}}`, `{"setup": {...}}`). Inbound frames are
//! parsed leniently and flattened into ordered `ChannelEvent`s.

use crate::codec::{bytes_to_transport_text, samples_to_pcm16};
use crate::config::SessionSetup;
use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Name of the single tool the storyteller may call.
pub const PLAY_SOUND_EFFECT: &str = "playSoundEffect";

/// Messages sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Value),
    Media(MediaChunk),
    FunctionResponses(FunctionResponse),
}

/// One chunk of microphone audio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub data: String,
    pub mime_type: String,
}

impl MediaChunk {
    /// Encode capture samples as base64 PCM16 tagged with their rate.
    pub fn pcm16(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: bytes_to_transport_text(&samples_to_pcm16(samples)),
            mime_type: format!("audio/pcm;rate={}", sample_rate),
        }
    }
}

/// Acknowledgment for a tool call. The service will not continue the turn without it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl FunctionResponse {
    pub fn ok(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: json!({ "result": "ok" }),
        }
    }

    pub fn error(id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: json!({ "error": message.into() }),
        }
    }
}

/// Body of the `setup` message sent right after the socket opens.
pub fn setup_payload(setup: &SessionSetup) -> Value {
    let sounds: Vec<&str> = setup.sound_effects.iter().map(|e| e.name()).collect();
    let mut payload = json!({
        "model": setup.model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice } }
            }
        },
        "systemInstruction": { "parts": [{ "text": setup.system_prompt() }] },
        "tools": [{
            "functionDeclarations": [{
                "name": PLAY_SOUND_EFFECT,
                "description": "Play a short sound effect to accompany the story.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "sound": { "type": "STRING", "enum": sounds }
                    },
                    "required": ["sound"]
                }
            }]
        }]
    });
    if setup.input_transcription {
        payload["inputAudioTranscription"] = json!({});
    }
    if setup.output_transcription {
        payload["outputAudioTranscription"] = json!({});
    }
    payload
}

/// Any frame received from the service. Every part is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub go_away: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Base64 PCM16 speech from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFragment {
    pub data: String,
    /// Rate announced in the fragment's mime type, if any.
    pub sample_rate: Option<u32>,
}

/// Typed inbound events, in arrival order.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Partial transcription of what the user said.
    InputTranscript(String),
    /// Partial transcription of what the storyteller is saying.
    OutputTranscript(String),
    Audio(AudioFragment),
    ToolCall(FunctionCall),
    TurnComplete,
    /// The user spoke over the storyteller.
    Interrupted,
    Error(VoiceError),
    Closed { reason: Option<String> },
}

impl ServerMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, VoiceError> {
        serde_json::from_slice(bytes)
            .map_err(|e| VoiceError::Protocol(format!("Malformed server message: {}", e)))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into events: transcripts, tool calls, audio, then interruption
    /// and turn completion last.
    pub fn into_events(self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if let Some(content) = self.server_content {
            if let Some(t) = content.input_transcription {
                events.push(ChannelEvent::InputTranscript(t.text));
            }
            if let Some(t) = content.output_transcription {
                events.push(ChannelEvent::OutputTranscript(t.text));
            }
            if let Some(call) = self.tool_call.as_ref() {
                events.extend(call.function_calls.iter().cloned().map(ChannelEvent::ToolCall));
            }
            if let Some(turn) = content.model_turn {
                for inline in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                    events.push(ChannelEvent::Audio(AudioFragment {
                        sample_rate: inline.mime_type.as_deref().and_then(parse_rate),
                        data: inline.data,
                    }));
                }
            }
            if content.interrupted {
                events.push(ChannelEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ChannelEvent::TurnComplete);
            }
        } else if let Some(call) = self.tool_call {
            events.extend(call.function_calls.into_iter().map(ChannelEvent::ToolCall));
        }
        events
    }
}

/// `audio/pcm;rate=24000` → `Some(24000)`. A zero rate is not a rate.
pub fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok().filter(|&rate: &u32| rate > 0))
}
