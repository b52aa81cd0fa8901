//! Gateway client: one persistent bidirectional connection to the external
//! service, driving the handshake/heartbeat/resume protocol state machine
//! and dispatching decoded events to callbacks.
//!
//! Callbacks run on the session task. By contract they only enqueue work or
//! mutate small in-memory state; they must never block on I/O.

pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use ember_relay_contract::PresenceConfig;

use self::protocol::{
    close_code, opcode, CreatedChannel, GatewayFrame, HelloPayload, InboundMessage, ReadyPayload,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);
const INVALID_SESSION_DELAY: Duration = Duration::from_secs(5);

/// Why a gateway session or connection attempt ended.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway authentication failed (close code {0})")]
    AuthenticationFailed(u16),
    #[error("gateway rejected the declared intents (close code {0})")]
    DisallowedIntents(u16),
    #[error("gateway connection dropped: {0}")]
    ConnectionDropped(String),
    #[error("gateway stream closed: {0}")]
    StreamClosed(String),
    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Fatal configuration errors stop all reconnection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::DisallowedIntents(_)
        )
    }
}

/// Resumable-session identifiers. Mutated only by the gateway session task;
/// survives across physical connection attempts to enable resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub intents: u64,
}

impl SessionState {
    pub fn new(intents: u64) -> Self {
        Self {
            session_id: None,
            last_sequence: None,
            intents,
        }
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.last_sequence.is_some()
    }

    /// Forgets the resumable session; the next handshake will identify.
    pub fn clear(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
    }
}

/// Decoded events surfaced by the session task.
pub trait GatewayEvents: Send {
    fn on_ready(&mut self, _bot_user_id: &str) {}
    fn on_resumed(&mut self) {}
    fn on_message(&mut self, _message: InboundMessage) {}
    fn on_channel_create(&mut self, _channel: CreatedChannel) {}
}

/// What a transport read produced.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(GatewayFrame),
    /// The peer closed the connection, optionally with a close code.
    Closed(Option<u16>),
    /// Control traffic with no protocol meaning.
    Ignored,
}

/// Capability set of a concrete gateway transport. The reconnect/backoff
/// policy is generic over this; the websocket specifics live in one
/// implementation.
#[async_trait]
pub trait GatewayTransport: Send {
    async fn connect(&mut self, url: &str) -> Result<(), GatewayError>;
    async fn read(&mut self) -> Result<TransportEvent, GatewayError>;
    async fn send(&mut self, frame: &GatewayFrame) -> Result<(), GatewayError>;
    async fn close(&mut self);
}

/// The production transport over tokio-tungstenite.
#[derive(Default)]
pub struct WebSocketTransport {
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> Result<&mut WebSocketStream<MaybeTlsStream<TcpStream>>, GatewayError> {
        self.stream
            .as_mut()
            .ok_or_else(|| GatewayError::StreamClosed("transport is not connected".to_string()))
    }
}

#[async_trait]
impl GatewayTransport for WebSocketTransport {
    async fn connect(&mut self, url: &str) -> Result<(), GatewayError> {
        let (stream, _response) = connect_async(url).await.map_err(classify_ws_error)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read(&mut self) -> Result<TransportEvent, GatewayError> {
        match self.stream()?.next().await {
            Some(Ok(WsMessage::Text(text))) => Ok(decode_frame(text.as_bytes())),
            Some(Ok(WsMessage::Binary(bytes))) => Ok(decode_frame(&bytes)),
            Some(Ok(WsMessage::Close(frame))) => {
                Ok(TransportEvent::Closed(frame.map(|f| f.code.into())))
            }
            Some(Ok(_)) => Ok(TransportEvent::Ignored),
            Some(Err(error)) => Err(classify_ws_error(error)),
            None => Err(GatewayError::StreamClosed("stream ended".to_string())),
        }
    }

    async fn send(&mut self, frame: &GatewayFrame) -> Result<(), GatewayError> {
        let json = serde_json::to_string(frame)
            .map_err(|error| GatewayError::Protocol(format!("unserializable frame: {error}")))?;
        self.stream()?
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(classify_ws_error)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

fn decode_frame(bytes: &[u8]) -> TransportEvent {
    match serde_json::from_slice::<GatewayFrame>(bytes) {
        Ok(frame) => TransportEvent::Frame(frame),
        Err(error) => {
            warn!(%error, "dropping undecodable gateway frame");
            TransportEvent::Ignored
        }
    }
}

fn classify_ws_error(error: WsError) -> GatewayError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            GatewayError::StreamClosed("socket already closed".to_string())
        }
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NetworkUnreachable
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::TimedOut => GatewayError::ConnectionDropped(io.to_string()),
            _ => GatewayError::StreamClosed(io.to_string()),
        },
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            GatewayError::ConnectionDropped("connection reset without closing handshake".to_string())
        }
        other => GatewayError::Protocol(other.to_string()),
    }
}

fn classify_close(code: Option<u16>) -> GatewayError {
    match code {
        Some(code_value @ close_code::AUTHENTICATION_FAILED) => {
            GatewayError::AuthenticationFailed(code_value)
        }
        Some(code_value @ (close_code::INVALID_INTENTS | close_code::DISALLOWED_INTENTS)) => {
            GatewayError::DisallowedIntents(code_value)
        }
        Some(code_value) => GatewayError::StreamClosed(format!("close code {code_value}")),
        None => GatewayError::StreamClosed("closed without a code".to_string()),
    }
}

/// One persistent gateway connection and its session state.
pub struct GatewayClient {
    token: String,
    url: String,
    presence: Option<PresenceConfig>,
    transport: Box<dyn GatewayTransport>,
    pub session: SessionState,
}

impl GatewayClient {
    pub fn new(
        token: impl Into<String>,
        url: impl Into<String>,
        intents: u64,
        presence: Option<PresenceConfig>,
        transport: Box<dyn GatewayTransport>,
    ) -> Self {
        Self {
            token: token.into(),
            url: url.into(),
            presence,
            transport,
            session: SessionState::new(intents),
        }
    }

    /// Runs a single physical connection to completion: connect, await
    /// hello, identify or resume, then read until the stream ends or a
    /// shutdown is requested. `Ok(())` means the session closed on request;
    /// every other outcome is a classified [`GatewayError`].
    pub async fn run_session(
        &mut self,
        events: &mut dyn GatewayEvents,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        self.transport.connect(&self.url).await?;
        debug!(url = %self.url, "gateway connected, awaiting hello");

        let result = self.drive_session(events, shutdown).await;
        // The socket is always released here; the heartbeat timer died with
        // `drive_session`, which is what guarantees its cancellation.
        self.transport.close().await;
        result
    }

    async fn drive_session(
        &mut self,
        events: &mut dyn GatewayEvents,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        let hello = self.await_hello().await?;
        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        self.send_auth().await?;

        let mut recovered_once = false;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("gateway session closing on request");
                        return Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = protocol::build_heartbeat(self.session.last_sequence);
                    self.transport.send(&beat).await?;
                }
                event = self.transport.read() => match event {
                    Ok(TransportEvent::Frame(frame)) => {
                        self.handle_frame(frame, events, &mut recovered_once).await?;
                    }
                    Ok(TransportEvent::Closed(code)) => return Err(classify_close(code)),
                    Ok(TransportEvent::Ignored) => {}
                    Err(error) => return Err(error),
                },
            }
        }
    }

    async fn await_hello(&mut self) -> Result<HelloPayload, GatewayError> {
        let wait = async {
            loop {
                match self.transport.read().await? {
                    TransportEvent::Frame(frame) if frame.op == opcode::HELLO => {
                        let data = frame.d.ok_or_else(|| {
                            GatewayError::Protocol("hello frame missing payload".to_string())
                        })?;
                        return serde_json::from_value::<HelloPayload>(data).map_err(|error| {
                            GatewayError::Protocol(format!("undecodable hello payload: {error}"))
                        });
                    }
                    TransportEvent::Frame(_) | TransportEvent::Ignored => {}
                    TransportEvent::Closed(code) => return Err(classify_close(code)),
                }
            }
        };
        tokio::time::timeout(HELLO_TIMEOUT, wait)
            .await
            .map_err(|_| GatewayError::Protocol("timed out waiting for hello".to_string()))?
    }

    /// Sends Resume when a resumable session is held, Identify otherwise.
    async fn send_auth(&mut self) -> Result<(), GatewayError> {
        let frame = match (&self.session.session_id, self.session.last_sequence) {
            (Some(session_id), Some(sequence)) => {
                info!(session_id = %session_id, sequence, "resuming gateway session");
                protocol::build_resume(&self.token, session_id, sequence)
            }
            _ => {
                info!(intents = self.session.intents, "identifying to gateway");
                protocol::build_identify(&self.token, self.session.intents, self.presence.as_ref())
            }
        };
        self.transport.send(&frame).await
    }

    async fn handle_frame(
        &mut self,
        frame: GatewayFrame,
        events: &mut dyn GatewayEvents,
        recovered_once: &mut bool,
    ) -> Result<(), GatewayError> {
        match frame.op {
            opcode::DISPATCH => {
                self.handle_dispatch(frame, events);
                Ok(())
            }
            opcode::HEARTBEAT => {
                // Server-requested beat: answer immediately with the latest
                // acknowledged sequence.
                let beat = protocol::build_heartbeat(self.session.last_sequence);
                self.transport.send(&beat).await
            }
            opcode::INVALID_SESSION => {
                if *recovered_once {
                    return Err(GatewayError::Protocol(
                        "session invalidated again after re-identify".to_string(),
                    ));
                }
                *recovered_once = true;
                warn!("gateway invalidated the session, re-identifying");
                self.session.clear();
                tokio::time::sleep(INVALID_SESSION_DELAY).await;
                self.send_auth().await
            }
            opcode::HELLO => {
                warn!("ignoring unexpected hello mid-session");
                Ok(())
            }
            other => {
                debug!(op = other, "ignoring unrecognized gateway opcode");
                Ok(())
            }
        }
    }

    fn handle_dispatch(&mut self, frame: GatewayFrame, events: &mut dyn GatewayEvents) {
        // Sequence first, unconditionally, so the next heartbeat always
        // acknowledges it regardless of the event type.
        if let Some(sequence) = frame.s {
            self.session.last_sequence = Some(sequence);
        }

        match frame.t.as_deref().unwrap_or("") {
            "READY" => {
                let Some(data) = frame.d else {
                    warn!("ready event missing payload");
                    return;
                };
                match serde_json::from_value::<ReadyPayload>(data) {
                    Ok(ready) => {
                        info!(session_id = %ready.session_id, "gateway session ready");
                        self.session.session_id = Some(ready.session_id);
                        events.on_ready(&ready.user.id);
                    }
                    Err(error) => warn!(%error, "undecodable ready payload"),
                }
            }
            "RESUMED" => {
                info!("gateway session resumed");
                events.on_resumed();
            }
            "MESSAGE_CREATE" => {
                let Some(data) = frame.d else { return };
                match serde_json::from_value::<InboundMessage>(data) {
                    Ok(message) => events.on_message(message),
                    Err(error) => debug!(%error, "undecodable message payload"),
                }
            }
            "CHANNEL_CREATE" => {
                let Some(data) = frame.d else { return };
                match serde_json::from_value::<CreatedChannel>(data) {
                    Ok(channel) => events.on_channel_create(channel),
                    Err(error) => debug!(%error, "undecodable channel payload"),
                }
            }
            other => trace!(event = other, "ignoring gateway dispatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_close, classify_ws_error, close_code, GatewayError, SessionState};
    use tokio_tungstenite::tungstenite::Error as WsError;

    #[test]
    fn session_state_resume_requires_both_fields() {
        let mut state = SessionState::new(0);
        assert!(!state.can_resume());
        state.session_id = Some("sess".to_string());
        assert!(!state.can_resume());
        state.last_sequence = Some(3);
        assert!(state.can_resume());
        state.clear();
        assert!(!state.can_resume());
        assert!(state.session_id.is_none());
        assert!(state.last_sequence.is_none());
    }

    #[test]
    fn fatal_close_codes_map_to_fatal_errors() {
        assert!(classify_close(Some(close_code::AUTHENTICATION_FAILED)).is_fatal());
        assert!(classify_close(Some(close_code::INVALID_INTENTS)).is_fatal());
        assert!(classify_close(Some(close_code::DISALLOWED_INTENTS)).is_fatal());
        assert!(!classify_close(Some(1000)).is_fatal());
        assert!(!classify_close(None).is_fatal());
    }

    #[test]
    fn reset_io_errors_classify_as_dropped() {
        let reset = WsError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(
            classify_ws_error(reset),
            GatewayError::ConnectionDropped(_)
        ));

        let closed = WsError::AlreadyClosed;
        assert!(matches!(
            classify_ws_error(closed),
            GatewayError::StreamClosed(_)
        ));
    }
}
