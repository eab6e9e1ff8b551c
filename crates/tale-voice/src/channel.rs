//! Session channel: one bidirectional link to the live service.
//!
//! The transport (a websocket pumped by a tokio task, or an in-memory peer in
//! tests) is hidden behind two ordered queues: `ClientMessage`s out and
//! `ChannelEvent`s in. The orchestrator only ever sees those.

use crate::config::{LiveConfig, SessionSetup};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{setup_payload, ChannelEvent, ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Queue ends held by the session side.
pub struct SessionChannel {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Queue ends held by whatever plays the remote service.
pub struct ChannelPeer {
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
}

impl SessionChannel {
    /// A connected pair with no transport in between.
    pub fn in_memory() -> (SessionChannel, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            SessionChannel {
                outbound: out_tx,
                inbound: ev_rx,
            },
            ChannelPeer {
                events: ev_tx,
                outbound: out_rx,
            },
        )
    }

    pub fn send(&self, message: ClientMessage) -> VoiceResult<()> {
        self.outbound
            .send(message)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }
}

/// Opens live sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve once the service has acknowledged the session setup.
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<SessionChannel>;
}

/// Lifecycle of a session handle. A handle is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    NotStarted,
    Connecting,
    Open,
    Closed,
    Errored,
}

/// The one live channel a session owns.
pub struct SessionHandle {
    state: HandleState,
    channel: Option<SessionChannel>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            state: HandleState::NotStarted,
            channel: None,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    pub async fn open(&mut self, connector: &dyn Connector, setup: &SessionSetup) -> VoiceResult<()> {
        if self.state != HandleState::NotStarted {
            return Err(VoiceError::Connection(format!(
                "Session handle cannot be reopened (state: {:?})",
                self.state
            )));
        }
        self.state = HandleState::Connecting;
        match connector.connect(setup).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = HandleState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = HandleState::Errored;
                Err(e)
            }
        }
    }

    pub fn send(&self, message: ClientMessage) -> VoiceResult<()> {
        match (&self.channel, self.state) {
            (Some(channel), HandleState::Open) => channel.send(message),
            _ => Err(VoiceError::ChannelSend(format!(
                "Session not open (state: {:?})",
                self.state
            ))),
        }
    }

    /// Next inbound event. `None` once the handle no longer has a channel or
    /// the transport went away.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        match self.channel.as_mut() {
            Some(channel) => channel.recv().await,
            None => None,
        }
    }

    pub fn mark_errored(&mut self) {
        self.state = HandleState::Errored;
    }

    /// Drop the channel, which closes the remote side. Idempotent.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("Session channel closed");
        }
        if self.state != HandleState::Errored {
            self.state = HandleState::Closed;
        }
    }
}

/// Connector for the hosted live websocket API.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: LiveConfig,
}

impl WebSocketConnector {
    pub fn new(config: LiveConfig) -> Self {
        // rustls needs a process-wide crypto provider for wss://; ignore if already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<SessionChannel> {
        info!("🌐 Connecting to live service ({})", self.config.endpoint);

        let handshake = async {
            let (ws, _) = tokio_tungstenite::connect_async(self.config.url()).await?;
            let (mut write, mut read) = ws.split();

            let setup_frame = serde_json::to_string(&ClientMessage::Setup(setup_payload(setup)))?;
            write.send(Message::Text(setup_frame)).await?;

            wait_for_setup(&mut read).await?;
            Ok::<_, VoiceError>((write, read))
        };

        let (write, read) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| VoiceError::Connection("Timed out waiting for session setup".to_string()))?
            .map_err(|e| match e {
                VoiceError::Connection(_) => e,
                other => VoiceError::Connection(other.to_string()),
            })?;

        info!("✅ Live session open");

        let (channel, peer) = SessionChannel::in_memory();
        tokio::spawn(pump(write, read, peer));
        Ok(channel)
    }
}

async fn wait_for_setup<R>(read: &mut R) -> VoiceResult<()>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        let bytes = match frame? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(VoiceError::Connection(format!("Closed during setup: {}", reason)));
            }
            _ => continue,
        };
        if ServerMessage::parse(&bytes)?.is_setup_complete() {
            return Ok(());
        }
    }
    Err(VoiceError::Connection("Connection ended before setup completed".to_string()))
}

/// Shuttle frames between the websocket and the session queues until either
/// side goes away.
async fn pump<W, R>(mut write: W, mut read: R, peer: ChannelPeer)
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let ChannelPeer {
        events,
        mut outbound,
    } = peer;

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping unserializable outbound message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        let _ = events.send(ChannelEvent::Error(e.into()));
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    debug!("Outbound queue dropped, websocket closed");
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => forward(&events, text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => forward(&events, &bytes),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    let _ = events.send(ChannelEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(ChannelEvent::Error(e.into()));
                    break;
                }
                None => {
                    let _ = events.send(ChannelEvent::Closed { reason: None });
                    break;
                }
            },
        }
    }
}

fn forward(events: &mpsc::UnboundedSender<ChannelEvent>, bytes: &[u8]) {
    match ServerMessage::parse(bytes) {
        Ok(message) => {
            if let Some(go_away) = &message.go_away {
                warn!("Service is going away: {}", go_away);
            }
            for event in message.into_events() {
                if events.send(event).is_err() {
                    return;
                }
            }
        }
        Err(e) => {
            let _ = events.send(ChannelEvent::Error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FunctionResponse, MediaChunk};
    use std::sync::Mutex;

    struct OnePeer(Mutex<Option<ChannelPeer>>, Mutex<Option<SessionChannel>>);

    #[async_trait]
    impl Connector for OnePeer {
        async fn connect(&self, _setup: &SessionSetup) -> VoiceResult<SessionChannel> {
            self.1
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| VoiceError::Connection("refused".into()))
        }
    }

    fn connector() -> OnePeer {
        let (channel, peer) = SessionChannel::in_memory();
        OnePeer(Mutex::new(Some(peer)), Mutex::new(Some(channel)))
    }

    #[tokio::test]
    async fn handle_walks_its_lifecycle_once() {
        let connector = connector();
        let mut handle = SessionHandle::new();
        assert_eq!(handle.state(), HandleState::NotStarted);
        assert!(handle.send(ClientMessage::Media(MediaChunk::pcm16(&[0.0], 16000))).is_err());

        handle.open(&connector, &SessionSetup::default()).await.unwrap();
        assert!(handle.is_open());

        let mut peer = connector.0.lock().unwrap().take().unwrap();
        handle
            .send(ClientMessage::FunctionResponses(FunctionResponse::ok("1", "playSoundEffect")))
            .unwrap();
        assert!(matches!(
            peer.outbound.recv().await,
            Some(ClientMessage::FunctionResponses(r)) if r.id == "1"
        ));

        peer.events.send(ChannelEvent::TurnComplete).unwrap();
        assert!(matches!(handle.recv().await, Some(ChannelEvent::TurnComplete)));

        handle.close();
        handle.close();
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(handle.recv().await.is_none());
        assert!(peer.outbound.recv().await.is_none());

        let err = handle.open(&connector, &SessionSetup::default()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn failed_connect_marks_errored() {
        let connector = OnePeer(Mutex::new(None), Mutex::new(None));
        let mut handle = SessionHandle::new();
        let err = handle.open(&connector, &SessionSetup::default()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Connection(_)));
        assert_eq!(handle.state(), HandleState::Errored);
        handle.close();
        assert_eq!(handle.state(), HandleState::Errored);
    }

    #[tokio::test]
    async fn forward_flattens_and_reports_garbage() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward(
            &tx,
            br#"{"serverContent":{"inputTranscription":{"text":"hi"},"turnComplete":true}}"#,
        );
        forward(&tx, b"garbage");
        assert!(matches!(rx.recv().await, Some(ChannelEvent::InputTranscript(t)) if t == "hi"));
        assert!(matches!(rx.recv().await, Some(ChannelEvent::TurnComplete)));
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Error(VoiceError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn failed_tls_handshake_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and hang up without speaking TLS.
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let mut config = LiveConfig::new("k");
        config.endpoint = format!("wss://127.0.0.1:{}/live", port);
        config.connect_timeout = std::time::Duration::from_secs(5);

        let result = WebSocketConnector::new(config)
            .connect(&SessionSetup::default())
            .await;

        assert!(matches!(result, Err(VoiceError::Connection(_))));
    }

    #[tokio::test]
    #[ignore] // Requires network access and TALE_API_KEY
    async fn live_service_accepts_setup() {
        let _ = dotenvy::dotenv();
        let config = LiveConfig::from_env().expect("TALE_API_KEY not set");
        let channel = WebSocketConnector::new(config)
            .connect(&SessionSetup::default())
            .await;
        assert!(channel.is_ok());
    }
}
