//! # WebSocket Voice Streaming Handler
//!
//! Three endpoints upgrade to a WebSocket and run one voice session each:
//! - `/ws/tts_stream`: text chunks in, converted speech out
//! - `/ws/tts`: one request (query `text`, or a first JSON frame), one utterance
//! - `/ws/rvc`: recorded 16-bit PCM in, converted speech out
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects with optional `speaker` (and `text`) query parameters
//! 2. **Ready**: Server sends `{"event":"ready"}` once the session can accept input
//! 3. **Input**: JSON control messages (`text`, `speaker`, `end`) or binary PCM
//! 4. **Output**: Binary PCM16 frames of a fixed duration, then `{"event":"end"}`
//! 5. **Errors**: `{"event":"error","detail":...}`
//!
//! ## Actor Model:
//! The [`VoiceSocket`] actor only translates WebSocket frames into
//! [`SessionEvent`]s. The session itself runs in a separate task that writes
//! back through [`ActorSink`], waiting for the actor to accept each message.

use crate::error::{AppError, StreamError};
use crate::middleware::RequestId;
use crate::session::protocol::{parse_client_message, parse_init_request, parse_speaker, InitRequest};
use crate::session::{
    run_one_shot, run_session, Outbound, PeerGone, PeerSink, SessionEvent, SessionMode,
    SessionStateMachine,
};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often a ping is sent to the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A client silent for this long is disconnected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a one-shot socket waits for its request frame.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Speaker id, as a number string
    pub speaker: Option<String>,
    /// One-shot text: appended and flushed immediately
    pub text: Option<String>,
}

/// WebSocket actor for one voice session.
pub struct VoiceSocket {
    session_id: String,

    /// Inbound events for the session task
    events: mpsc::UnboundedSender<SessionEvent>,

    /// The session and its event receiver, until the actor starts
    pending: Option<(SessionStateMachine, mpsc::UnboundedReceiver<SessionEvent>)>,

    /// Last ping/pong or message from the client
    last_heartbeat: Instant,

    /// The next data frame is a one-shot request
    awaiting_init: bool,
}

impl VoiceSocket {
    pub fn new(machine: SessionStateMachine) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            session_id: machine.id().to_string(),
            events,
            pending: Some((machine, receiver)),
            last_heartbeat: Instant::now(),
            awaiting_init: false,
        }
    }

    /// Read the first data frame as a one-shot request.
    pub fn awaiting_init(mut self) -> Self {
        self.awaiting_init = true;
        self
    }

    /// Queue an event before the session task starts (one-shot `text`).
    pub fn queue(&self, event: SessionEvent) {
        self.forward(event);
    }

    fn forward(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(session_id = %self.session_id, "Session task already finished");
        }
    }
}

/// Writes session output to the WebSocket through the actor mailbox.
pub struct ActorSink {
    addr: Addr<VoiceSocket>,
}

#[async_trait]
impl PeerSink for ActorSink {
    async fn deliver(&mut self, message: Outbound) -> Result<(), PeerGone> {
        self.addr.send(Deliver(message)).await.map_err(|_| PeerGone)
    }

    fn is_open(&self) -> bool {
        self.addr.connected()
    }
}

/// One outbound message for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Deliver(Outbound);

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                act.forward(SessionEvent::Disconnect);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        match self.pending.take() {
            Some((machine, receiver)) => {
                let sink = ActorSink {
                    addr: ctx.address(),
                };
                if machine.mode() == SessionMode::OneShot {
                    actix_web::rt::spawn(run_one_shot(machine, receiver, sink, INIT_TIMEOUT));
                } else {
                    actix_web::rt::spawn(run_session(machine, receiver, sink));
                }
            }
            None => {
                error!(session_id = %self.session_id, "WebSocket started without a session");
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender after this ends the session task
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

/// Translate one inbound text frame.
pub fn inbound_event(text: &str) -> SessionEvent {
    match parse_client_message(text) {
        Ok(message) => SessionEvent::from(message),
        Err(StreamError::Protocol(reason)) => SessionEvent::Malformed(reason),
        Err(other) => SessionEvent::Malformed(other.to_string()),
    }
}

/// Translate the request frame of a one-shot socket.
pub fn init_event(raw: &str) -> SessionEvent {
    match parse_init_request(raw) {
        Ok(request) => SessionEvent::Init(request),
        Err(StreamError::Protocol(reason)) => SessionEvent::Malformed(reason),
        Err(other) => SessionEvent::Malformed(other.to_string()),
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                let event = if std::mem::take(&mut self.awaiting_init) {
                    init_event(&text)
                } else {
                    inbound_event(&text)
                };
                self.forward(event);
            }
            Ok(ws::Message::Binary(data)) => {
                // A one-shot request may arrive as a binary frame of UTF-8 JSON
                let event = if std::mem::take(&mut self.awaiting_init) {
                    init_event(&String::from_utf8_lossy(&data))
                } else {
                    SessionEvent::AudioChunk(data.to_vec())
                };
                self.forward(event);
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, reason = ?reason, "WebSocket closed by client");
                self.forward(SessionEvent::Disconnect);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                self.forward(SessionEvent::InternalError(format!("websocket protocol error: {err}")));
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        match msg.0 {
            Outbound::Event(event) => ctx.text(event.to_json()),
            Outbound::Audio(frame) => ctx.binary(frame.into_bytes()),
            Outbound::Close => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}

/// Resolve the `speaker` query parameter against the allow list.
fn resolve_speaker(app_state: &AppState, raw: Option<&str>) -> Result<u32, AppError> {
    let synthesis = &app_state.config.synthesis;
    let speaker = match raw {
        Some(raw) => parse_speaker(&serde_json::Value::String(raw.to_string()))
            .map_err(|e| AppError::BadRequest(e.detail()))?,
        None => synthesis.default_speaker,
    };

    if !synthesis.is_allowed(speaker) {
        return Err(AppError::BadRequest(format!("speaker {speaker} is not allowed")));
    }
    Ok(speaker)
}

/// Admit a session and upgrade the connection.
fn start_session(
    req: &HttpRequest,
    stream: web::Payload,
    app_state: &AppState,
    mode: SessionMode,
    query: &StreamQuery,
) -> ActixResult<HttpResponse> {
    let speaker = resolve_speaker(app_state, query.speaker.as_deref())?;
    let session_id = app_state.sessions.try_register(mode, speaker)?;
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    info!(
        session_id = %session_id,
        request_id = %request_id,
        mode = mode.as_str(),
        speaker = speaker,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket session"
    );

    let machine = SessionStateMachine::new(session_id, mode, speaker, app_state.clone());
    let mut socket = VoiceSocket::new(machine);
    let query_text = query.text.as_ref().filter(|t| !t.trim().is_empty());

    match (mode, query_text) {
        (SessionMode::TextToSpeech, Some(text)) => {
            socket.queue(SessionEvent::TextChunk(text.clone()));
            socket.queue(SessionEvent::EndOfUtterance);
        }
        (SessionMode::OneShot, Some(text)) => {
            socket.queue(SessionEvent::Init(InitRequest {
                text: text.clone(),
                speaker: None,
            }));
        }
        (SessionMode::OneShot, None) => socket = socket.awaiting_init(),
        _ => {}
    }

    // On a failed upgrade the machine is dropped with the actor and the
    // registry entry goes with it
    ws::start(socket, req, stream)
}

/// `GET /ws/tts_stream`
pub async fn tts_stream_socket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<StreamQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_session(&req, stream, &app_state, SessionMode::TextToSpeech, &query)
}

/// `GET /ws/tts`
pub async fn tts_socket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<StreamQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_session(&req, stream, &app_state, SessionMode::OneShot, &query)
}

/// `GET /ws/rvc`
pub async fn conversion_socket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<StreamQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_session(&req, stream, &app_state, SessionMode::ConversionOnly, &query)
}
