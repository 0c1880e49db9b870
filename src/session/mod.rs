//! # Voice Session Module
//!
//! One session per WebSocket connection. The WebSocket actor only translates
//! frames into [`SessionEvent`]s; everything else happens in a driver task that
//! owns the [`SessionStateMachine`] and writes back through a [`PeerSink`].
//!
//! ## Session Lifecycle:
//! ```text
//! CONNECTING ──connect──► READY ◄──end──┐
//!                           │            │
//!                      text chunk        │
//!                           ▼            │
//!                       STREAMING ───────┘
//!
//! any state ──fatal / disconnect──► ENDED      any state ──internal error──► ERROR
//! ```
//!
//! ## Key Components:
//! - **protocol**: JSON control messages in both directions
//! - **pipeline**: text or recorded audio → converted, conditioned clip
//! - **machine**: the per-connection state machine and its driver loop
//! - **registry**: live sessions, for capacity limits and reporting

pub mod machine;   // Per-connection orchestration
pub mod pipeline;  // Segment rendering
pub mod protocol;  // Wire messages
pub mod registry;  // Live session bookkeeping

pub use machine::{run_one_shot, run_session, SessionStateMachine};
pub use pipeline::VoicePipeline;
pub use registry::SessionRegistry;

use crate::audio::packetizer::Frame;
use async_trait::async_trait;
use protocol::{ClientMessage, InitRequest, ServerEvent};
use serde::Serialize;
use thiserror::Error;

/// What a session converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Text in, converted speech out (`/ws/tts_stream`)
    TextToSpeech,
    /// One request, one utterance, then close (`/ws/tts`)
    OneShot,
    /// Recorded PCM in, converted speech out (`/ws/rvc`)
    ConversionOnly,
}

impl SessionMode {
    /// Whether text messages are accepted.
    pub fn takes_text(&self) -> bool {
        matches!(self, SessionMode::TextToSpeech | SessionMode::OneShot)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::TextToSpeech => "text_to_speech",
            SessionMode::OneShot => "one_shot",
            SessionMode::ConversionOnly => "conversion_only",
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Streaming,
    Ended,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Streaming => "streaming",
            SessionState::Ended => "ended",
            SessionState::Error => "error",
        }
    }

    /// No further events are processed once a session is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Error)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connect,
    /// The request of a one-shot session
    Init(InitRequest),
    TextChunk(String),
    AudioChunk(Vec<u8>),
    SpeakerChange(serde_json::Value),
    EndOfUtterance,
    /// A well-formed message of a type this service does not handle
    Unrecognized,
    /// A message that could not be parsed
    Malformed(String),
    Disconnect,
    InternalError(String),
}

impl From<ClientMessage> for SessionEvent {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Text { text } => SessionEvent::TextChunk(text),
            ClientMessage::End => SessionEvent::EndOfUtterance,
            ClientMessage::Speaker { speaker } => SessionEvent::SpeakerChange(speaker),
            ClientMessage::Unknown => SessionEvent::Unrecognized,
        }
    }
}

/// Messages written to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Audio(Frame),
    Close,
}

/// The peer connection has gone away.
#[derive(Debug, Clone, Copy, Error)]
#[error("peer connection closed")]
pub struct PeerGone;

/// Where a session writes its output.
///
/// `deliver` may suspend until the transport accepts the message; that is the
/// session's only backpressure.
#[async_trait]
pub trait PeerSink: Send {
    async fn deliver(&mut self, message: Outbound) -> Result<(), PeerGone>;

    /// Cheap liveness check, consulted between segments.
    fn is_open(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S: PeerSink + ?Sized> PeerSink for &mut S {
    async fn deliver(&mut self, message: Outbound) -> Result<(), PeerGone> {
        (**self).deliver(message).await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
