//! Voice Orchestrator - The main coordination layer
//!
//! Owns the one live session (microphone, speakers, channel, playback
//! schedule) and the status machine. Events are consumed one at a time in
//! arrival order; every failure ends in a full teardown.

use crate::audio::{
    AudioChunk, AudioDevices, CaptureConfig, CaptureStream, OutputSink, PlaybackConfig, PlaybackId,
    SystemAudio,
};
use crate::channel::{Connector, HandleState, SessionHandle, WebSocketConnector};
use crate::codec::transport_text_to_bytes;
use crate::config::{LiveConfig, SessionSetup};
use crate::effects::{SoundBank, SoundEffect};
use crate::error::{FailureKind, VoiceError, VoiceResult};
use crate::playback::{decode, Completion, PlaybackScheduler};
use crate::protocol::{
    AudioFragment, ChannelEvent, ClientMessage, FunctionCall, FunctionResponse, MediaChunk,
    PLAY_SOUND_EFFECT,
};
use crate::transcript::Conversation;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Configuration for the voice orchestrator
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub setup: SessionSetup,
}

impl OrchestratorConfig {
    /// Default devices with the session setup taken from the environment.
    pub fn from_env() -> Self {
        Self {
            setup: SessionSetup::from_env(),
            ..Self::default()
        }
    }
}

/// What the UI shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Listening,
    /// The service has started answering the open user turn (storyteller
    /// transcript or a tool call) and none of its audio has arrived yet.
    /// User speech alone keeps `Listening`: the user may still be talking.
    Thinking,
    Speaking,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::Listening => "listening",
            Status::Thinking => "thinking",
            Status::Speaking => "speaking",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// One unit of work for the orchestrator.
#[derive(Debug)]
pub enum SessionEvent {
    Channel(ChannelEvent),
    PlaybackEnded(PlaybackId),
    Frame(AudioChunk),
}

/// Everything that lives exactly as long as one session.
struct LiveSession {
    capture: Option<Box<dyn CaptureStream>>,
    output: Option<Box<dyn OutputSink>>,
    handle: SessionHandle,
    frames: mpsc::Receiver<AudioChunk>,
    ended: mpsc::UnboundedReceiver<PlaybackId>,
    scheduler: PlaybackScheduler,
    /// Audio has arrived for the current turn.
    heard_audio: bool,
}

impl LiveSession {
    fn new(frames: mpsc::Receiver<AudioChunk>, ended: mpsc::UnboundedReceiver<PlaybackId>) -> Self {
        Self {
            capture: None,
            output: None,
            handle: SessionHandle::new(),
            frames,
            ended,
            scheduler: PlaybackScheduler::new(),
            heard_audio: false,
        }
    }
}

/// The main voice orchestration system
///
/// This coordinates:
/// - Microphone streaming to the live service (CPAL)
/// - Gapless playback of streamed speech and barge-in (Rodio)
/// - Tool-driven sound effects
/// - The transcript and the status machine
pub struct VoiceOrchestrator {
    config: OrchestratorConfig,
    devices: Box<dyn AudioDevices>,
    connector: Arc<dyn Connector>,

    status: Status,
    /// Set exactly while `status == Status::Error`.
    error: Option<String>,
    status_tx: watch::Sender<Status>,

    conversation: Conversation,
    effects: SoundBank,
    session: Option<LiveSession>,
}

impl VoiceOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        devices: impl AudioDevices + 'static,
        connector: impl Connector + 'static,
    ) -> Self {
        let (status_tx, _) = watch::channel(Status::Idle);
        Self {
            config,
            devices: Box::new(devices),
            connector: Arc::new(connector),
            status: Status::Idle,
            error: None,
            status_tx,
            conversation: Conversation::new(),
            effects: SoundBank::new(),
            session: None,
        }
    }

    /// Default devices and the hosted live service.
    pub fn system(config: OrchestratorConfig, live: LiveConfig) -> Self {
        Self::new(config, SystemAudio, WebSocketConnector::new(live))
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Receive every status change (e.g. to drive an indicator).
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub fn is_session_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_state(&self) -> HandleState {
        self.session
            .as_ref()
            .map(|s| s.handle.state())
            .unwrap_or(HandleState::NotStarted)
    }

    /// Playback schedule cursor (0 without a session).
    pub fn playback_cursor(&self) -> f64 {
        self.session.as_ref().map(|s| s.scheduler.cursor()).unwrap_or(0.0)
    }

    pub fn active_playback(&self) -> usize {
        self.session.as_ref().map(|s| s.scheduler.active_count()).unwrap_or(0)
    }

    /// Open a session: microphone, speakers, then the live channel.
    ///
    /// Only allowed from `Idle` or `Error`. Any failure tears down whatever
    /// was acquired and leaves the orchestrator in `Error`.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if !matches!(self.status, Status::Idle | Status::Error) || self.session.is_some() {
            warn!("Start ignored, session already {}", self.status);
            return Err(VoiceError::AlreadyActive(self.status.to_string()));
        }

        info!("🚀 Starting story session");
        self.set_status(Status::Idle);

        match self.open_session().await {
            Ok(()) => {
                self.set_status(Status::Listening);
                info!("✅ Story session live, listening");
                Ok(())
            }
            Err(e) => {
                self.fail(e.failure_kind(), &e);
                Err(e)
            }
        }
    }

    async fn open_session(&mut self) -> VoiceResult<()> {
        let (frame_tx, frame_rx) = mpsc::channel(self.config.capture.queue_depth.max(1));
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let session = self.session.insert(LiveSession::new(frame_rx, ended_rx));

        session.capture = Some(self.devices.open_capture(&self.config.capture, frame_tx)?);
        session.output = Some(self.devices.open_output(&self.config.playback, ended_tx)?);
        self.effects.preload();

        session
            .handle
            .open(self.connector.as_ref(), &self.config.setup)
            .await?;

        // Frames captured while connecting are stale; drop them.
        let mut dropped = 0usize;
        while session.frames.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} frame(s) captured before the session opened", dropped);
        }
        Ok(())
    }

    /// End the session and return to `Idle`. Safe to call at any time, any number of times.
    pub fn stop(&mut self) {
        self.teardown();
        self.set_status(Status::Idle);
    }

    /// Wait for the next event of the live session, channel events first.
    /// `None` when there is no session.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let session = self.session.as_mut()?;
        tokio::select! {
            biased;
            event = session.handle.recv() => Some(SessionEvent::Channel(
                event.unwrap_or(ChannelEvent::Closed { reason: None }),
            )),
            Some(id) = session.ended.recv() => Some(SessionEvent::PlaybackEnded(id)),
            Some(chunk) = session.frames.recv() => Some(SessionEvent::Frame(chunk)),
        }
    }

    /// Process events until the session ends (stop, remote close or failure).
    pub async fn run(&mut self) {
        while let Some(event) = self.next_event().await {
            self.handle(event);
        }
    }

    /// Apply one event to the session and status machine.
    pub fn handle(&mut self, event: SessionEvent) {
        if self.session.is_none() {
            debug!("Event after teardown ignored: {:?}", event);
            return;
        }
        match event {
            SessionEvent::Frame(chunk) => self.on_frame(chunk),
            SessionEvent::PlaybackEnded(id) => self.on_playback_ended(id),
            SessionEvent::Channel(ChannelEvent::Error(e)) => {
                if let Some(session) = self.session.as_mut() {
                    session.handle.mark_errored();
                }
                self.fail(e.failure_kind(), &e);
            }
            SessionEvent::Channel(ChannelEvent::Closed { reason }) => {
                info!(
                    "Live service closed the session{}",
                    reason.map(|r| format!(": {}", r)).unwrap_or_default()
                );
                self.stop();
            }
            SessionEvent::Channel(event) => {
                if let Err(e) = self.on_channel_event(event) {
                    self.fail(FailureKind::Processing, &e);
                }
            }
        }
    }

    fn on_frame(&mut self, chunk: AudioChunk) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.handle.is_open() {
            return;
        }
        let media = MediaChunk::pcm16(&chunk.samples, self.config.capture.sample_rate);
        if let Err(e) = session.handle.send(ClientMessage::Media(media)) {
            debug!("Dropping capture frame: {}", e);
        }
    }

    fn on_playback_ended(&mut self, id: PlaybackId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.scheduler.on_ended(id) == Completion::Drained && self.status == Status::Speaking {
            debug!("Playback drained");
            self.set_status(Status::Listening);
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) -> VoiceResult<()> {
        match event {
            ChannelEvent::InputTranscript(text) => {
                self.conversation.push_user_delta(&text);
            }
            ChannelEvent::OutputTranscript(text) => {
                self.conversation.push_ai_delta(&text);
                self.note_model_activity();
            }
            ChannelEvent::Audio(fragment) => self.on_audio(fragment)?,
            ChannelEvent::ToolCall(call) => {
                self.note_model_activity();
                self.on_tool_call(call)?;
            }
            ChannelEvent::TurnComplete => {
                let summary = self.conversation.complete_turn();
                if let Some(text) = summary.ai.as_deref() {
                    info!("📖 Storyteller: {}", text);
                }
                if let Some(session) = self.session.as_mut() {
                    session.heard_audio = false;
                }
                self.set_status(Status::Listening);
            }
            ChannelEvent::Interrupted => {
                if let Some(session) = self.session.as_mut() {
                    session.scheduler.interrupt(session.output.as_deref_mut());
                }
            }
            ChannelEvent::Error(e) => return Err(e),
            ChannelEvent::Closed { .. } => {}
        }
        Ok(())
    }

    /// Model output before any audio: the user's turn is being worked on.
    fn note_model_activity(&mut self) {
        let heard_audio = self.session.as_ref().map(|s| s.heard_audio).unwrap_or(true);
        if self.status == Status::Listening && self.conversation.has_open_user_turn() && !heard_audio {
            self.set_status(Status::Thinking);
        }
    }

    fn on_audio(&mut self, fragment: AudioFragment) -> VoiceResult<()> {
        let bytes = transport_text_to_bytes(&fragment.data)?;
        let sample_rate = fragment.sample_rate.unwrap_or(self.config.playback.sample_rate);
        if sample_rate == 0 || self.config.playback.channels == 0 {
            return Err(VoiceError::Protocol(format!(
                "Unplayable audio format ({}Hz x{})",
                sample_rate, self.config.playback.channels
            )));
        }
        let buffer = decode(&bytes, sample_rate, self.config.playback.channels);

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let scheduled = session
            .scheduler
            .schedule_next(session.output.as_deref_mut(), &buffer);
        if scheduled.is_some() {
            session.heard_audio = true;
            if self.status != Status::Speaking {
                self.set_status(Status::Speaking);
            }
        }
        Ok(())
    }

    fn on_tool_call(&mut self, call: FunctionCall) -> VoiceResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let response = if call.name == PLAY_SOUND_EFFECT {
            let sound = call.args.get("sound").and_then(|v| v.as_str()).unwrap_or_default();
            match sound.parse::<SoundEffect>() {
                Ok(effect) => {
                    self.effects.play(effect, session.output.as_deref_mut());
                    FunctionResponse::ok(call.id, call.name)
                }
                Err(e) => {
                    warn!("Tool call {}: {}", call.id, e);
                    FunctionResponse::error(call.id, call.name, e.to_string())
                }
            }
        } else {
            warn!("Unknown tool requested: {}", call.name);
            let message = format!("Unknown function: {}", call.name);
            FunctionResponse::error(call.id, call.name, message)
        };

        session.handle.send(ClientMessage::FunctionResponses(response))
    }

    /// Terminal failure: tear everything down and surface a user message.
    fn fail(&mut self, kind: FailureKind, err: &VoiceError) {
        error!("Session failed ({:?}): {}", kind, err);
        self.teardown();
        self.error = Some(kind.user_message().to_string());
        self.status = Status::Error;
        self.status_tx.send_replace(Status::Error);
    }

    /// Release every session resource. Tolerates partially acquired sessions.
    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(mut capture) = session.capture.take() {
            capture.stop();
        }
        session.scheduler.interrupt(session.output.as_deref_mut());
        if let Some(mut output) = session.output.take() {
            output.close();
        }
        session.handle.close();
        self.conversation.abandon_turn();
        info!("🛑 Story session torn down");
    }

    /// Every non-error transition goes through here, keeping error ⇔ Error.
    fn set_status(&mut self, status: Status) {
        self.error = None;
        if self.status != status {
            debug!("Status {} → {}", self.status, status);
        }
        self.status = status;
        self.status_tx.send_replace(status);
    }
}

impl Drop for VoiceOrchestrator {
    fn drop(&mut self) {
        // Ensure cleanup happens
        self.teardown();
    }
}
