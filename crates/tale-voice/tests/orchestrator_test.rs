//! Integration tests for the voice orchestration system
//!
//! Devices and the live service are faked, so these run anywhere. The one
//! hardware test at the bottom is ignored by default.

use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use tale_voice::{
    bytes_to_transport_text, samples_to_pcm16, AudioChunk, AudioDevices, AudioFragment,
    CaptureConfig, CaptureStream, ChannelEvent, ChannelPeer, ClientMessage, Connector,
    FunctionCall, HandleState, OrchestratorConfig, OutputSink, PcmBuffer, PlaybackConfig,
    PlaybackId, SessionChannel, SessionEvent, SessionSetup, Speaker, Status, VoiceError,
    VoiceOrchestrator, VoiceResult,
};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

type CaptureTap = Arc<Mutex<Option<mpsc::Sender<AudioChunk>>>>;

#[derive(Default)]
struct DeviceState {
    deny_microphone: bool,
    now: f64,
    capture_open: bool,
    output_open: bool,
    frames: Option<mpsc::Sender<AudioChunk>>,
    /// Shares the capture sender with the fake service.
    capture_tap: Option<CaptureTap>,
    ended: Option<mpsc::UnboundedSender<PlaybackId>>,
    scheduled: Vec<(PlaybackId, f64, f64)>,
    stopped: Vec<PlaybackId>,
    oneshots: usize,
}

#[derive(Clone, Default)]
struct FakeDevices(Rc<RefCell<DeviceState>>);

struct FakeCapture(Rc<RefCell<DeviceState>>);

impl CaptureStream for FakeCapture {
    fn stop(&mut self) {
        let mut state = self.0.borrow_mut();
        state.capture_open = false;
        state.frames = None;
    }
}

struct FakeSink(Rc<RefCell<DeviceState>>);

impl OutputSink for FakeSink {
    fn current_time(&self) -> f64 {
        self.0.borrow().now
    }

    fn is_running(&self) -> bool {
        self.0.borrow().output_open
    }

    fn schedule(&mut self, id: PlaybackId, buffer: &PcmBuffer, start_at: f64) -> VoiceResult<()> {
        self.0
            .borrow_mut()
            .scheduled
            .push((id, start_at, buffer.duration_secs()));
        Ok(())
    }

    fn stop_source(&mut self, id: PlaybackId) {
        self.0.borrow_mut().stopped.push(id);
    }

    fn play_oneshot(&mut self, _buffer: &PcmBuffer) -> VoiceResult<()> {
        self.0.borrow_mut().oneshots += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.0.borrow_mut().output_open = false;
    }
}

impl AudioDevices for FakeDevices {
    fn open_capture(
        &mut self,
        _config: &CaptureConfig,
        frames: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureStream>> {
        let mut state = self.0.borrow_mut();
        if state.deny_microphone {
            return Err(VoiceError::AudioDevice("permission denied".into()));
        }
        state.capture_open = true;
        if let Some(tap) = &state.capture_tap {
            *tap.lock().unwrap() = Some(frames.clone());
        }
        state.frames = Some(frames);
        Ok(Box::new(FakeCapture(self.0.clone())))
    }

    fn open_output(
        &mut self,
        _config: &PlaybackConfig,
        ended: mpsc::UnboundedSender<PlaybackId>,
    ) -> VoiceResult<Box<dyn OutputSink>> {
        let mut state = self.0.borrow_mut();
        state.output_open = true;
        state.ended = Some(ended);
        Ok(Box::new(FakeSink(self.0.clone())))
    }
}

impl FakeDevices {
    fn set_now(&self, now: f64) {
        self.0.borrow_mut().now = now;
    }

    fn scheduled(&self) -> Vec<(PlaybackId, f64, f64)> {
        self.0.borrow().scheduled.clone()
    }

    fn frame_sender(&self) -> Option<mpsc::Sender<AudioChunk>> {
        self.0.borrow().frames.clone()
    }
}

/// Hands out one in-memory channel per successful connect.
#[derive(Clone, Default)]
struct FakeService {
    refuse: Arc<Mutex<bool>>,
    peer: Arc<Mutex<Option<ChannelPeer>>>,
    /// Frames "spoken" while the handshake is in flight.
    capture_tap: CaptureTap,
    frames_while_connecting: usize,
}

#[async_trait::async_trait]
impl Connector for FakeService {
    async fn connect(&self, _setup: &SessionSetup) -> VoiceResult<SessionChannel> {
        if let Some(frames) = self.capture_tap.lock().unwrap().as_ref() {
            for _ in 0..self.frames_while_connecting {
                let _ = frames.try_send(AudioChunk {
                    samples: vec![-0.5; 4],
                });
            }
        }
        if *self.refuse.lock().unwrap() {
            return Err(VoiceError::Connection("handshake refused".into()));
        }
        let (channel, peer) = SessionChannel::in_memory();
        *self.peer.lock().unwrap() = Some(peer);
        Ok(channel)
    }
}

impl FakeService {
    fn take_peer(&self) -> ChannelPeer {
        self.peer.lock().unwrap().take().expect("no session was opened")
    }
}

fn setup() -> (VoiceOrchestrator, FakeDevices, FakeService) {
    let devices = FakeDevices::default();
    let service = FakeService::default();
    let orchestrator =
        VoiceOrchestrator::new(OrchestratorConfig::default(), devices.clone(), service.clone());
    (orchestrator, devices, service)
}

/// Base64 PCM16 of `secs` seconds of silence at 24 kHz.
fn speech(secs: f64) -> ChannelEvent {
    let samples = vec![0.0f32; (24000.0 * secs) as usize];
    ChannelEvent::Audio(AudioFragment {
        data: bytes_to_transport_text(&samples_to_pcm16(&samples)),
        sample_rate: None,
    })
}

fn channel(event: ChannelEvent) -> SessionEvent {
    SessionEvent::Channel(event)
}

fn drain_outbound(peer: &mut ChannelPeer) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = peer.outbound.try_recv() {
        messages.push(message);
    }
    messages
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_opens_devices_and_listens() {
    let (mut orchestrator, devices, _service) = setup();
    let mut status_rx = orchestrator.subscribe_status();

    assert_ok!(orchestrator.start().await);

    assert_eq!(orchestrator.status(), Status::Listening);
    assert_eq!(*status_rx.borrow_and_update(), Status::Listening);
    assert_eq!(orchestrator.session_state(), HandleState::Open);
    assert!(orchestrator.error_message().is_none());
    assert!(devices.0.borrow().capture_open);
    assert!(devices.0.borrow().output_open);
}

#[tokio::test]
async fn start_while_active_is_rejected() {
    let (mut orchestrator, _devices, _service) = setup();
    assert_ok!(orchestrator.start().await);

    let err = assert_err!(orchestrator.start().await);
    assert!(matches!(err, VoiceError::AlreadyActive(_)));
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_everything() {
    let (mut orchestrator, devices, _service) = setup();

    orchestrator.stop();
    assert_eq!(orchestrator.status(), Status::Idle);

    assert_ok!(orchestrator.start().await);
    orchestrator.stop();
    orchestrator.stop();

    assert_eq!(orchestrator.status(), Status::Idle);
    assert!(!orchestrator.is_session_active());
    assert!(!devices.0.borrow().capture_open);
    assert!(!devices.0.borrow().output_open);
    assert_eq!(orchestrator.playback_cursor(), 0.0);
    assert!(orchestrator.next_event().await.is_none());
}

#[tokio::test]
async fn microphone_denied_reports_error_and_recovers() {
    let (mut orchestrator, devices, _service) = setup();
    devices.0.borrow_mut().deny_microphone = true;

    assert_err!(orchestrator.start().await);
    assert_eq!(orchestrator.status(), Status::Error);
    assert!(orchestrator.error_message().unwrap().contains("Microphone"));
    assert!(!orchestrator.is_session_active());

    devices.0.borrow_mut().deny_microphone = false;
    assert_ok!(orchestrator.start().await);
    assert_eq!(orchestrator.status(), Status::Listening);
    assert!(orchestrator.error_message().is_none());
}

#[tokio::test]
async fn refused_connection_tears_down_devices() {
    let (mut orchestrator, devices, service) = setup();
    *service.refuse.lock().unwrap() = true;

    assert_err!(orchestrator.start().await);

    assert_eq!(orchestrator.status(), Status::Error);
    assert!(orchestrator.error_message().unwrap().contains("connect"));
    assert!(!devices.0.borrow().capture_open);
    assert!(!devices.0.borrow().output_open);
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn microphone_frames_are_streamed_as_pcm16() {
    let (mut orchestrator, devices, service) = setup();
    assert_ok!(orchestrator.start().await);
    let mut peer = service.take_peer();

    let frames = devices.frame_sender().unwrap();
    frames
        .try_send(AudioChunk {
            samples: vec![0.0, 0.5],
        })
        .unwrap();

    let event = orchestrator.next_event().await.unwrap();
    assert!(matches!(event, SessionEvent::Frame(_)));
    orchestrator.handle(event);

    match drain_outbound(&mut peer).as_slice() {
        [ClientMessage::Media(chunk)] => {
            assert_eq!(chunk.data, "AAAAQA==");
            assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        }
        other => panic!("unexpected outbound messages: {:?}", other),
    }
}

#[tokio::test]
async fn frames_captured_while_connecting_are_discarded() {
    let devices = FakeDevices::default();
    let tap = CaptureTap::default();
    devices.0.borrow_mut().capture_tap = Some(tap.clone());
    let service = FakeService {
        capture_tap: tap,
        frames_while_connecting: 3,
        ..FakeService::default()
    };
    let mut orchestrator =
        VoiceOrchestrator::new(OrchestratorConfig::default(), devices.clone(), service.clone());

    assert_ok!(orchestrator.start().await);
    let mut peer = service.take_peer();
    assert!(drain_outbound(&mut peer).is_empty());

    devices
        .frame_sender()
        .unwrap()
        .try_send(AudioChunk {
            samples: vec![0.5; 4],
        })
        .unwrap();

    // The first frame the session sees is the one captured after opening.
    match orchestrator.next_event().await.unwrap() {
        SessionEvent::Frame(chunk) => {
            assert_eq!(chunk.samples, vec![0.5; 4]);
            orchestrator.handle(SessionEvent::Frame(chunk));
        }
        other => panic!("expected a capture frame, got {:?}", other),
    }

    let fresh = bytes_to_transport_text(&samples_to_pcm16(&[0.5; 4]));
    match drain_outbound(&mut peer).as_slice() {
        [ClientMessage::Media(chunk)] => assert_eq!(chunk.data, fresh),
        other => panic!("unexpected outbound messages: {:?}", other),
    }
}

#[tokio::test]
async fn fragments_play_back_to_back_then_drain_to_listening() {
    let (mut orchestrator, devices, _service) = setup();
    assert_ok!(orchestrator.start().await);
    devices.set_now(10.0);

    orchestrator.handle(channel(speech(0.5)));
    assert_eq!(orchestrator.status(), Status::Speaking);
    orchestrator.handle(channel(speech(0.5)));
    orchestrator.handle(channel(speech(0.5)));

    let starts: Vec<f64> = devices.scheduled().iter().map(|s| s.1).collect();
    assert_eq!(starts, vec![10.0, 10.5, 11.0]);
    assert_eq!(orchestrator.playback_cursor(), 11.5);

    let ids: Vec<PlaybackId> = devices.scheduled().iter().map(|s| s.0).collect();
    orchestrator.handle(SessionEvent::PlaybackEnded(ids[0]));
    orchestrator.handle(SessionEvent::PlaybackEnded(ids[1]));
    assert_eq!(orchestrator.status(), Status::Speaking);
    orchestrator.handle(SessionEvent::PlaybackEnded(ids[2]));
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn late_fragment_starts_now() {
    let (mut orchestrator, devices, _service) = setup();
    assert_ok!(orchestrator.start().await);

    devices.set_now(1.0);
    orchestrator.handle(channel(speech(0.5)));
    devices.set_now(5.0);
    orchestrator.handle(channel(speech(0.5)));

    assert_eq!(devices.scheduled()[1].1, 5.0);
    assert_eq!(orchestrator.playback_cursor(), 5.5);
}

#[tokio::test]
async fn playback_end_is_delivered_by_next_event() {
    let (mut orchestrator, devices, _service) = setup();
    assert_ok!(orchestrator.start().await);
    orchestrator.handle(channel(speech(0.25)));

    let id = devices.scheduled()[0].0;
    devices.0.borrow().ended.as_ref().unwrap().send(id).unwrap();

    let event = orchestrator.next_event().await.unwrap();
    assert!(matches!(event, SessionEvent::PlaybackEnded(ended) if ended == id));
    orchestrator.handle(event);
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn interruption_silences_queue_and_resets_cursor() {
    let (mut orchestrator, devices, _service) = setup();
    assert_ok!(orchestrator.start().await);
    devices.set_now(2.0);
    for _ in 0..3 {
        orchestrator.handle(channel(speech(0.5)));
    }

    orchestrator.handle(channel(ChannelEvent::Interrupted));

    assert_eq!(devices.0.borrow().stopped.len(), 3);
    assert_eq!(orchestrator.active_playback(), 0);
    assert_eq!(orchestrator.playback_cursor(), 0.0);

    // Late end notifications of the interrupted fragments change nothing.
    let first = devices.scheduled()[0].0;
    orchestrator.handle(SessionEvent::PlaybackEnded(first));
    assert_eq!(orchestrator.status(), Status::Speaking);

    orchestrator.handle(channel(ChannelEvent::TurnComplete));
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn undecodable_audio_is_a_processing_error() {
    let (mut orchestrator, devices, _service) = setup();
    assert_ok!(orchestrator.start().await);

    orchestrator.handle(channel(ChannelEvent::Audio(AudioFragment {
        data: "%%% not base64 %%%".into(),
        sample_rate: None,
    })));

    assert_eq!(orchestrator.status(), Status::Error);
    assert!(orchestrator.error_message().unwrap().contains("processing"));
    assert!(!orchestrator.is_session_active());
    assert!(!devices.0.borrow().output_open);
}

#[tokio::test]
async fn zero_sample_rate_is_a_processing_error() {
    let (mut orchestrator, devices, _service) = setup();
    assert_ok!(orchestrator.start().await);

    let samples = samples_to_pcm16(&[0.1; 240]);
    orchestrator.handle(channel(ChannelEvent::Audio(AudioFragment {
        data: bytes_to_transport_text(&samples),
        sample_rate: Some(0),
    })));

    assert!(devices.scheduled().is_empty());
    assert_eq!(orchestrator.status(), Status::Error);
    assert!(orchestrator.error_message().unwrap().contains("processing"));
}

// ---------------------------------------------------------------------------
// Transcript and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_and_storyteller_turns_are_recorded() {
    let (mut orchestrator, _devices, _service) = setup();
    assert_ok!(orchestrator.start().await);

    for delta in ["Once ", "upon ", "a time"] {
        orchestrator.handle(channel(ChannelEvent::InputTranscript(delta.into())));
    }
    assert_eq!(orchestrator.conversation().last().unwrap().text, "Once upon a time");

    orchestrator.handle(channel(ChannelEvent::OutputTranscript("The dragon".into())));
    assert_eq!(orchestrator.status(), Status::Thinking);
    orchestrator.handle(channel(ChannelEvent::OutputTranscript(" smiled.".into())));
    assert_eq!(orchestrator.conversation().len(), 1);

    orchestrator.handle(channel(ChannelEvent::TurnComplete));

    let turns: Vec<(Speaker, String)> = orchestrator
        .conversation()
        .turns()
        .map(|t| (t.speaker, t.text.clone()))
        .collect();
    assert_eq!(
        turns,
        vec![
            (Speaker::User, "Once upon a time".to_string()),
            (Speaker::Ai, "The dragon smiled.".to_string()),
        ]
    );
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn thinking_requires_an_open_user_turn() {
    let (mut orchestrator, _devices, _service) = setup();
    assert_ok!(orchestrator.start().await);

    orchestrator.handle(channel(ChannelEvent::OutputTranscript("Hello".into())));
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn thinking_starts_when_the_service_answers() {
    let (mut orchestrator, _devices, service) = setup();
    assert_ok!(orchestrator.start().await);
    let _peer = service.take_peer();

    orchestrator.handle(channel(ChannelEvent::InputTranscript("A dragon".into())));
    assert_eq!(orchestrator.status(), Status::Listening);

    orchestrator.handle(channel(ChannelEvent::ToolCall(FunctionCall {
        id: "call-1".into(),
        name: "playSoundEffect".into(),
        args: json!({ "sound": "whoosh" }),
    })));
    assert_eq!(orchestrator.status(), Status::Thinking);

    orchestrator.handle(channel(speech(0.25)));
    assert_eq!(orchestrator.status(), Status::Speaking);

    // No way back to thinking once audio has been heard this turn.
    orchestrator.handle(channel(ChannelEvent::OutputTranscript("Whoosh!".into())));
    assert_eq!(orchestrator.status(), Status::Speaking);
}

#[tokio::test]
async fn stop_mid_turn_keeps_user_words() {
    let (mut orchestrator, _devices, _service) = setup();
    assert_ok!(orchestrator.start().await);
    orchestrator.handle(channel(ChannelEvent::InputTranscript("The end".into())));
    orchestrator.handle(channel(ChannelEvent::OutputTranscript("And then".into())));

    orchestrator.stop();

    assert_eq!(orchestrator.conversation().len(), 1);
    assert!(!orchestrator.conversation().has_open_user_turn());
    assert!(orchestrator.conversation().pending_ai_text().is_empty());
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sound_effect_call_plays_and_is_acknowledged() {
    let (mut orchestrator, devices, service) = setup();
    assert_ok!(orchestrator.start().await);
    let mut peer = service.take_peer();

    orchestrator.handle(channel(ChannelEvent::ToolCall(FunctionCall {
        id: "call-7".into(),
        name: "playSoundEffect".into(),
        args: json!({ "sound": "sparkle" }),
    })));

    assert_eq!(devices.0.borrow().oneshots, 1);
    match drain_outbound(&mut peer).as_slice() {
        [ClientMessage::FunctionResponses(response)] => {
            assert_eq!(response.id, "call-7");
            assert_eq!(response.name, "playSoundEffect");
            assert_eq!(response.response, json!({ "result": "ok" }));
        }
        other => panic!("unexpected outbound messages: {:?}", other),
    }
    assert_eq!(orchestrator.status(), Status::Listening);
}

#[tokio::test]
async fn unknown_sound_is_acknowledged_with_error() {
    let (mut orchestrator, devices, service) = setup();
    assert_ok!(orchestrator.start().await);
    let mut peer = service.take_peer();

    orchestrator.handle(channel(ChannelEvent::ToolCall(FunctionCall {
        id: "call-8".into(),
        name: "playSoundEffect".into(),
        args: json!({ "sound": "kazoo" }),
    })));

    assert_eq!(devices.0.borrow().oneshots, 0);
    match drain_outbound(&mut peer).as_slice() {
        [ClientMessage::FunctionResponses(response)] => {
            assert_eq!(response.id, "call-8");
            assert!(response.response.get("error").is_some());
        }
        other => panic!("unexpected outbound messages: {:?}", other),
    }
    assert!(orchestrator.is_session_active());
}

// ---------------------------------------------------------------------------
// Remote failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_close_returns_to_idle() {
    let (mut orchestrator, devices, service) = setup();
    assert_ok!(orchestrator.start().await);

    drop(service.take_peer());

    let event = orchestrator.next_event().await.unwrap();
    assert!(matches!(event, SessionEvent::Channel(ChannelEvent::Closed { .. })));
    orchestrator.handle(event);

    assert_eq!(orchestrator.status(), Status::Idle);
    assert!(orchestrator.error_message().is_none());
    assert!(!devices.0.borrow().capture_open);
}

#[tokio::test]
async fn transport_error_reports_connection_failure() {
    let (mut orchestrator, _devices, service) = setup();
    assert_ok!(orchestrator.start().await);
    let peer = service.take_peer();

    peer.events
        .send(ChannelEvent::Error(VoiceError::Connection("reset by peer".into())))
        .unwrap();
    orchestrator.run().await;

    assert_eq!(orchestrator.status(), Status::Error);
    assert!(orchestrator.error_message().unwrap().contains("connect"));
    assert!(!orchestrator.is_session_active());
}

#[tokio::test]
#[ignore] // Requires audio hardware and TALE_API_KEY
async fn test_live_session_smoke() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _ = dotenvy::dotenv();

    let live = tale_voice::LiveConfig::from_env().expect("TALE_API_KEY not set");
    let mut orchestrator = VoiceOrchestrator::system(OrchestratorConfig::from_env(), live);

    orchestrator.start().await.expect("Failed to start session");
    assert_eq!(orchestrator.status(), Status::Listening);

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    orchestrator.stop();
    assert_eq!(orchestrator.status(), Status::Idle);
}
