//! # Session State Machine
//!
//! Per-connection orchestrator. It owns the session's text buffer, recorded
//! audio and speaker, and drives segments through the [`VoicePipeline`] one at
//! a time, writing frames to the peer before starting the next segment.
//!
//! ## Failure handling:
//! - A segment that fails transiently is logged, counted and dropped; the
//!   utterance continues with the next segment
//! - An unusable conversion engine sends one `error` event and ends the session
//! - Protocol errors are answered with an `error` event; the session continues
//! - A closed peer ends the session after the segment in flight
//!
//! [`run_session`] drives streaming sessions; [`run_one_shot`] waits for the
//! single request of a `/ws/tts` session, speaks it, and ends.
//!
//! ## Key Rust Concepts Used:
//! - **Enums as state**: [`SessionState`] and [`SessionEvent`] with exhaustive `match`
//! - **Result branching**: segment outcomes are inspected, never unwound
//! - **Drop**: the registry entry is released however the session ends

use super::pipeline::{RenderedSegment, SegmentError, VoicePipeline};
use super::protocol::{parse_speaker, ServerEvent};
use super::{Outbound, PeerGone, PeerSink, SessionEvent, SessionMode, SessionState};
use crate::audio::{codec, AudioClip};
use crate::engine::Voice;
use crate::error::StreamError;
use crate::segmenter::{Segment, TextBuffer};
use crate::state::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Why an event handler stopped early.
enum Halt {
    /// The peer is gone; nothing more can be delivered
    PeerGone,
    /// The session must end with this error
    Fatal(StreamError),
}

impl From<PeerGone> for Halt {
    fn from(_: PeerGone) -> Self {
        Halt::PeerGone
    }
}

pub struct SessionStateMachine {
    id: String,
    mode: SessionMode,
    state: SessionState,
    speaker: u32,
    buffer: TextBuffer,
    recording: Vec<u8>,
    /// Segments streamed in the current utterance
    sequence: u64,
    pipeline: Option<Arc<VoicePipeline>>,
    app: AppState,
}

impl SessionStateMachine {
    /// Create the machine for a session already admitted by the registry.
    pub fn new(id: String, mode: SessionMode, speaker: u32, app: AppState) -> Self {
        Self {
            id,
            mode,
            state: SessionState::Connecting,
            speaker,
            buffer: TextBuffer::new(),
            recording: Vec::new(),
            sequence: 0,
            pipeline: app.pipeline.clone(),
            app,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    #[cfg(test)]
    pub fn speaker(&self) -> u32 {
        self.speaker
    }

    #[cfg(test)]
    pub fn pending_text(&self) -> &str {
        self.buffer.pending()
    }

    /// Apply one event and return the resulting state.
    pub async fn handle<S>(&mut self, event: SessionEvent, sink: &mut S) -> SessionState
    where
        S: PeerSink + ?Sized,
    {
        if self.state.is_terminal() {
            debug!(session_id = %self.id, event = ?event, "Ignoring event after session end");
            return self.state;
        }

        let allowed_while_connecting = matches!(
            event,
            SessionEvent::Connect | SessionEvent::Disconnect | SessionEvent::InternalError(_)
        );
        if self.state == SessionState::Connecting && !allowed_while_connecting {
            if let Err(Halt::PeerGone) = self
                .protocol_error(StreamError::Protocol("session not ready".to_string()), sink)
                .await
            {
                self.set_state(SessionState::Ended);
            }
            return self.state;
        }

        let result = match event {
            SessionEvent::Connect => self.on_connect(sink).await,
            SessionEvent::TextChunk(text) => self.on_text(&text, sink).await,
            SessionEvent::AudioChunk(bytes) => self.on_audio(bytes, sink).await,
            SessionEvent::SpeakerChange(value) => self.on_speaker(&value, sink).await,
            SessionEvent::EndOfUtterance => self.on_end(sink).await,
            SessionEvent::Init(_) => {
                self.protocol_error(StreamError::Protocol("unexpected request".to_string()), sink)
                    .await
            }
            SessionEvent::Unrecognized => {
                debug!(session_id = %self.id, "Ignoring unrecognized message type");
                Ok(())
            }
            SessionEvent::Malformed(reason) => {
                self.protocol_error(StreamError::Protocol(reason), sink).await
            }
            SessionEvent::Disconnect => {
                info!(session_id = %self.id, "Peer disconnected");
                let _ = sink
                    .deliver(Outbound::Event(ServerEvent::Error {
                        detail: "peer disconnected".to_string(),
                    }))
                    .await;
                self.set_state(SessionState::Ended);
                Ok(())
            }
            SessionEvent::InternalError(reason) => {
                error!(session_id = %self.id, reason = %reason, "Session internal error");
                self.app.record_session_failed();
                let _ = sink
                    .deliver(Outbound::Event(ServerEvent::Error { detail: reason }))
                    .await;
                self.set_state(SessionState::Error);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(Halt::PeerGone) => {
                info!(session_id = %self.id, "Peer closed during streaming");
                self.set_state(SessionState::Ended);
            }
            Err(Halt::Fatal(err)) => {
                error!(session_id = %self.id, error = %err, "Ending session");
                self.app.record_session_failed();
                let _ = sink
                    .deliver(Outbound::Event(ServerEvent::Error { detail: err.detail() }))
                    .await;
                self.set_state(SessionState::Ended);
            }
        }

        self.state
    }

    async fn on_connect<S>(&mut self, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        if self.state != SessionState::Connecting {
            return self
                .protocol_error(StreamError::Protocol("already connected".to_string()), sink)
                .await;
        }

        if self.pipeline.is_none() {
            let reason = self
                .app
                .engine_error
                .clone()
                .unwrap_or_else(|| "voice conversion engine unavailable".to_string());
            return Err(Halt::Fatal(StreamError::Configuration(reason)));
        }

        self.emit(ServerEvent::Ready, sink).await?;
        self.set_state(SessionState::Ready);
        info!(
            session_id = %self.id,
            mode = self.mode.as_str(),
            speaker = self.speaker,
            "Session ready"
        );
        Ok(())
    }

    async fn on_text<S>(&mut self, chunk: &str, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        if !self.mode.takes_text() {
            return self
                .protocol_error(
                    StreamError::Protocol("text is not accepted on this socket".to_string()),
                    sink,
                )
                .await;
        }

        self.set_state(SessionState::Streaming);
        let segments = self.buffer.push(chunk);
        self.stream_segments(segments, sink).await
    }

    async fn on_audio<S>(&mut self, bytes: Vec<u8>, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        if self.mode != SessionMode::ConversionOnly {
            return self
                .protocol_error(
                    StreamError::Protocol("audio is not accepted on this socket".to_string()),
                    sink,
                )
                .await;
        }

        self.recording.extend_from_slice(&bytes);
        self.set_state(SessionState::Streaming);
        Ok(())
    }

    async fn on_speaker<S>(&mut self, value: &serde_json::Value, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        let speaker = match parse_speaker(value) {
            Ok(speaker) => speaker,
            Err(err) => return self.protocol_error(err, sink).await,
        };

        if !self.app.config.synthesis.is_allowed(speaker) {
            return self
                .protocol_error(
                    StreamError::Protocol(format!("speaker {speaker} is not allowed")),
                    sink,
                )
                .await;
        }

        self.speaker = speaker;
        self.app.sessions.update(&self.id, |r| r.speaker = speaker);
        info!(session_id = %self.id, speaker = speaker, "Speaker changed");
        Ok(())
    }

    async fn on_end<S>(&mut self, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        match self.mode {
            SessionMode::TextToSpeech => {
                let segments = self.buffer.flush();
                self.stream_segments(segments, sink).await?;
                self.emit(ServerEvent::End, sink).await?;
                self.buffer.clear();
                self.sequence = 0;
                self.set_state(SessionState::Ready);
            }
            SessionMode::OneShot => {
                let segments = self.buffer.flush();
                self.stream_segments(segments, sink).await?;
                self.emit(ServerEvent::End, sink).await?;
                self.set_state(SessionState::Ended);
            }
            SessionMode::ConversionOnly => {
                self.convert_recording(sink).await?;
                self.emit(ServerEvent::End, sink).await?;
                self.set_state(SessionState::Ended);
            }
        }
        Ok(())
    }

    /// Render and stream each segment in order.
    async fn stream_segments<S>(&mut self, segments: Vec<Segment>, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        let Some(pipeline) = self.pipeline.clone() else {
            return Err(Halt::Fatal(StreamError::Configuration(
                "voice pipeline unavailable".to_string(),
            )));
        };
        let min_chars = pipeline.settings().min_segment_chars;

        for segment in segments {
            if segment.char_len() < min_chars {
                debug!(session_id = %self.id, segment = %segment, "Skipping short segment");
                continue;
            }
            if !sink.is_open() {
                return Err(Halt::PeerGone);
            }

            let started = Instant::now();
            match pipeline.render_text(segment.as_str(), Voice::new(self.speaker)).await {
                Ok(rendered) => {
                    self.stream_rendered(&pipeline, &rendered, sink).await?;
                    info!(
                        session_id = %self.id,
                        sequence = self.sequence,
                        chars = segment.char_len(),
                        synth_ms = rendered.timings.synth_ms,
                        convert_ms = rendered.timings.convert_ms,
                        total_ms = started.elapsed().as_millis() as u64,
                        snr_db = rendered.snr_db,
                        "Segment streamed"
                    );
                }
                Err(err) => self.segment_failed(&segment, err)?,
            }
        }
        Ok(())
    }

    /// Convert everything recorded on a conversion-only socket.
    async fn convert_recording<S>(&mut self, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        let Some(pipeline) = self.pipeline.clone() else {
            return Err(Halt::Fatal(StreamError::Configuration(
                "voice pipeline unavailable".to_string(),
            )));
        };

        let mut bytes = std::mem::take(&mut self.recording);
        if bytes.len() % 2 != 0 {
            warn!(session_id = %self.id, bytes = bytes.len(), "Dropping trailing odd byte of PCM");
            bytes.pop();
        }
        if bytes.is_empty() {
            debug!(session_id = %self.id, "No audio recorded");
            return Ok(());
        }

        let samples = match codec::pcm16_to_f32(&bytes) {
            Ok(samples) => samples,
            Err(err) => return self.protocol_error(StreamError::Protocol(err.to_string()), sink).await,
        };
        let recording = AudioClip::new(samples, pipeline.settings().conversion_input_rate);
        let duration_ms = recording.duration_ms();

        let started = Instant::now();
        match pipeline.render_recording(recording).await {
            Ok(Some(rendered)) => {
                self.stream_rendered(&pipeline, &rendered, sink).await?;
                info!(
                    session_id = %self.id,
                    input_ms = duration_ms as u64,
                    convert_ms = rendered.timings.convert_ms,
                    total_ms = started.elapsed().as_millis() as u64,
                    snr_db = rendered.snr_db,
                    "Recording converted"
                );
            }
            Ok(None) => {
                info!(session_id = %self.id, input_ms = duration_ms as u64, "Recording too quiet, skipped");
            }
            Err(err) => {
                let segment_error = StreamError::from(err);
                if segment_error.is_terminal() {
                    return Err(Halt::Fatal(segment_error));
                }
                warn!(session_id = %self.id, error = %segment_error, "Recording dropped");
                self.app.record_segment_dropped();
                self.app.sessions.update(&self.id, |r| r.segments_dropped += 1);
            }
        }
        Ok(())
    }

    /// Send a rendered segment, preceded by the gap when it is not the first
    /// of the utterance.
    async fn stream_rendered<S>(
        &mut self,
        pipeline: &VoicePipeline,
        rendered: &RenderedSegment,
        sink: &mut S,
    ) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        let rate = rendered.clip.sample_rate;
        let mut frames = 0u64;
        if self.sequence > 0 {
            frames += self.send_clip(pipeline, &pipeline.gap(rate), sink).await?;
        }
        frames += self.send_clip(pipeline, &rendered.clip, sink).await?;
        self.sequence += 1;

        self.app
            .record_segment_rendered(frames, rendered.warmed, rendered.length_mismatch);
        self.app.sessions.update(&self.id, |r| {
            r.segments_rendered += 1;
            r.frames_sent += frames;
        });
        Ok(())
    }

    async fn send_clip<S>(
        &self,
        pipeline: &VoicePipeline,
        clip: &AudioClip,
        sink: &mut S,
    ) -> Result<u64, PeerGone>
    where
        S: PeerSink + ?Sized,
    {
        let mut sent = 0u64;
        for frame in pipeline.packetizer(clip.sample_rate).frames(clip) {
            sink.deliver(Outbound::Audio(frame)).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Drop a failed segment, or escalate if the engine is gone.
    fn segment_failed(&mut self, segment: &Segment, err: SegmentError) -> Result<(), Halt> {
        let err = StreamError::from(err);
        if err.is_terminal() {
            return Err(Halt::Fatal(err));
        }

        warn!(session_id = %self.id, segment = %segment, error = %err, "Segment dropped");
        self.app.record_segment_dropped();
        self.app.sessions.update(&self.id, |r| r.segments_dropped += 1);
        Ok(())
    }

    async fn protocol_error<S>(&mut self, err: StreamError, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        warn!(session_id = %self.id, error = %err, "Protocol error");
        self.emit(ServerEvent::Error { detail: err.detail() }, sink).await
    }

    async fn emit<S>(&self, event: ServerEvent, sink: &mut S) -> Result<(), Halt>
    where
        S: PeerSink + ?Sized,
    {
        sink.deliver(Outbound::Event(event)).await?;
        Ok(())
    }

    /// End the session after one last event, without touching the engines.
    async fn end_with<S>(&mut self, event: ServerEvent, sink: &mut S)
    where
        S: PeerSink + ?Sized,
    {
        let _ = sink.deliver(Outbound::Event(event)).await;
        self.set_state(SessionState::Ended);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(
                session_id = %self.id,
                from = self.state.as_str(),
                to = state.as_str(),
                "Session state change"
            );
            self.state = state;
            self.app.sessions.update(&self.id, |r| r.state = state);
        }
    }
}

impl Drop for SessionStateMachine {
    fn drop(&mut self) {
        if self.app.sessions.remove(&self.id) {
            debug!(session_id = %self.id, "Session released");
        }
    }
}

/// Drive one session to completion.
///
/// Sends `connect`, then applies events from `events` in order until the
/// session reaches a terminal state. A closed event channel counts as a
/// disconnect. The sink is closed and the session released on exit.
pub async fn run_session<S>(
    mut machine: SessionStateMachine,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut sink: S,
) -> SessionState
where
    S: PeerSink,
{
    machine.app.record_session_started();
    machine.handle(SessionEvent::Connect, &mut sink).await;
    finish(machine, events, sink).await
}

/// Drive a one-shot session.
///
/// The first event must be [`SessionEvent::Init`] and arrive within
/// `init_timeout`. Empty text is answered with `end` alone; otherwise the text
/// is spoken as one utterance and the session ends.
pub async fn run_one_shot<S>(
    mut machine: SessionStateMachine,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut sink: S,
    init_timeout: Duration,
) -> SessionState
where
    S: PeerSink,
{
    machine.app.record_session_started();

    match tokio::time::timeout(init_timeout, events.recv()).await {
        Ok(Some(SessionEvent::Init(request))) => {
            let text = request.text.trim();
            if text.is_empty() {
                debug!(session_id = %machine.id(), "Empty request, nothing to speak");
                machine.end_with(ServerEvent::End, &mut sink).await;
            } else {
                machine.handle(SessionEvent::Connect, &mut sink).await;
                if let Some(speaker) = request.speaker {
                    machine.handle(SessionEvent::SpeakerChange(speaker), &mut sink).await;
                }
                machine
                    .handle(SessionEvent::TextChunk(text.to_string()), &mut sink)
                    .await;
                machine.handle(SessionEvent::EndOfUtterance, &mut sink).await;
            }
        }
        Ok(Some(SessionEvent::Malformed(reason))) => {
            warn!(session_id = %machine.id(), reason = %reason, "Rejected one-shot request");
            machine.end_with(ServerEvent::Error { detail: reason }, &mut sink).await;
        }
        Ok(Some(SessionEvent::Disconnect)) | Ok(None) => {
            info!(session_id = %machine.id(), "Peer left before sending a request");
            machine.set_state(SessionState::Ended);
        }
        Ok(Some(other)) => {
            warn!(session_id = %machine.id(), event = ?other, "Expected a one-shot request");
            let detail = "expected a request with text".to_string();
            machine.end_with(ServerEvent::Error { detail }, &mut sink).await;
        }
        Err(_) => {
            warn!(session_id = %machine.id(), "No request before the timeout");
            let detail = "timeout".to_string();
            machine.end_with(ServerEvent::Error { detail }, &mut sink).await;
        }
    }

    finish(machine, events, sink).await
}

/// Apply remaining events until the session is terminal, then close the peer.
async fn finish<S>(
    mut machine: SessionStateMachine,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut sink: S,
) -> SessionState
where
    S: PeerSink,
{
    while !machine.state().is_terminal() {
        let event = events.recv().await.unwrap_or(SessionEvent::Disconnect);
        machine.handle(event, &mut sink).await;
    }

    let _ = sink.deliver(Outbound::Close).await;
    info!(session_id = %machine.id(), state = machine.state().as_str(), "Session finished");
    machine.state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::fakes::{FakeConverter, FakeSynthesizer};
    use crate::session::pipeline::tests::pipeline_with;
    use crate::session::protocol::InitRequest;
    use crate::session::testing::VecSink;

    fn app_with(synthesizer: FakeSynthesizer, converter: Arc<FakeConverter>) -> AppState {
        let pipeline = pipeline_with(synthesizer, converter);
        AppState::new(AppConfig::default(), Ok(Arc::new(pipeline)))
    }

    fn machine(app: &AppState, mode: SessionMode) -> SessionStateMachine {
        let id = app.sessions.try_register(mode, 1).unwrap();
        SessionStateMachine::new(id, mode, 1, app.clone())
    }

    fn is_audio(message: &Outbound) -> bool {
        matches!(message, Outbound::Audio(_))
    }

    #[tokio::test]
    async fn test_incomplete_chunk_waits_for_punctuation() {
        let converter = Arc::new(FakeConverter::new(24000));
        let synthesizer = FakeSynthesizer::new(24000);
        let app = app_with(synthesizer, converter.clone());
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        session.handle(SessionEvent::Connect, &mut sink).await;
        session.handle(SessionEvent::TextChunk("Hi".into()), &mut sink).await;
        assert_eq!(sink.messages.len(), 1);
        assert_eq!(session.pending_text(), "Hi");

        session.handle(SessionEvent::TextChunk("!".into()), &mut sink).await;
        let state = session.handle(SessionEvent::EndOfUtterance, &mut sink).await;

        assert_eq!(state, SessionState::Ready);
        assert_eq!(sink.events(), vec![ServerEvent::Ready, ServerEvent::End]);
        // ready, one contiguous run of frames, end
        assert_eq!(sink.messages.first(), Some(&Outbound::Event(ServerEvent::Ready)));
        assert_eq!(sink.messages.last(), Some(&Outbound::Event(ServerEvent::End)));
        let audio = &sink.messages[1..sink.messages.len() - 1];
        assert!(!audio.is_empty());
        assert!(audio.iter().all(is_audio));
        // "Hi!" → 4800 samples at 24 kHz → ten 20 ms frames
        assert_eq!(sink.frame_count(), 10);
        assert_eq!(converter.converted().len(), 1);
    }

    #[tokio::test]
    async fn test_gap_between_segments_of_one_utterance() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter.clone());
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        session.handle(SessionEvent::Connect, &mut sink).await;
        session.handle(SessionEvent::TextChunk("Hi! Yo!".into()), &mut sink).await;
        session.handle(SessionEvent::EndOfUtterance, &mut sink).await;

        // 10 frames for "Hi!", 3 frames (50 ms) of gap, 10 frames for "Yo!"
        assert_eq!(sink.frame_count(), 23);
        assert_eq!(app.get_metrics_snapshot().segments_rendered, 2);

        // A new utterance starts without a leading gap
        session.handle(SessionEvent::TextChunk("Ok!".into()), &mut sink).await;
        assert_eq!(sink.frame_count(), 33);
    }

    #[tokio::test]
    async fn test_failed_segment_is_dropped() {
        let converter = Arc::new(FakeConverter::new(24000));
        let synthesizer = FakeSynthesizer::new(24000).failing_on("Bad!");
        let app = app_with(synthesizer, converter);
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        session.handle(SessionEvent::Connect, &mut sink).await;
        session
            .handle(SessionEvent::TextChunk("Bad! Fine!".into()), &mut sink)
            .await;
        let state = session.handle(SessionEvent::EndOfUtterance, &mut sink).await;

        assert_eq!(state, SessionState::Ready);
        assert_eq!(sink.events(), vec![ServerEvent::Ready, ServerEvent::End]);
        assert_eq!(sink.frame_count(), 17);
        let metrics = app.get_metrics_snapshot();
        assert_eq!(metrics.segments_dropped, 1);
        assert_eq!(metrics.segments_rendered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_timeout_drops_only_that_segment() {
        let converter = Arc::new(FakeConverter::new(24000));
        let synthesizer =
            FakeSynthesizer::new(24000).stalling_on("Slow!", std::time::Duration::from_secs(600));
        let app = app_with(synthesizer, converter.clone());
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        session.handle(SessionEvent::Connect, &mut sink).await;
        session
            .handle(SessionEvent::TextChunk("Slow! Fine!".into()), &mut sink)
            .await;
        let state = session.handle(SessionEvent::EndOfUtterance, &mut sink).await;

        assert_eq!(state, SessionState::Ready);
        assert_eq!(sink.events(), vec![ServerEvent::Ready, ServerEvent::End]);
        // "Fine!" streams as the first segment, without a gap
        assert_eq!(sink.frame_count(), 17);
        assert_eq!(converter.converted().len(), 1);
        let metrics = app.get_metrics_snapshot();
        assert_eq!(metrics.segments_dropped, 1);
        assert_eq!(metrics.segments_rendered, 1);
    }

    #[tokio::test]
    async fn test_unavailable_engine_ends_session() {
        let converter = Arc::new(FakeConverter::unavailable(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter);
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        session.handle(SessionEvent::Connect, &mut sink).await;
        let state = session
            .handle(SessionEvent::TextChunk("Hello there.".into()), &mut sink)
            .await;
        assert_eq!(state, SessionState::Ended);

        // Further events are refused
        session.handle(SessionEvent::TextChunk("More.".into()), &mut sink).await;
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ServerEvent::Error { .. }));
        assert_eq!(sink.frame_count(), 0);
    }

    #[tokio::test]
    async fn test_degraded_start_sends_one_error() {
        let app = AppState::new(AppConfig::default(), Err("worker unreachable".to_string()));
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        let state = session.handle(SessionEvent::Connect, &mut sink).await;

        assert_eq!(state, SessionState::Ended);
        assert_eq!(
            sink.events(),
            vec![ServerEvent::Error {
                detail: "configuration error: worker unreachable".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_session_alive() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter);
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::default();

        session.handle(SessionEvent::Connect, &mut sink).await;
        session
            .handle(SessionEvent::Malformed("invalid message".into()), &mut sink)
            .await;
        session
            .handle(SessionEvent::SpeakerChange(serde_json::json!("abc")), &mut sink)
            .await;
        let state = session
            .handle(SessionEvent::AudioChunk(vec![0, 0]), &mut sink)
            .await;

        assert_eq!(state, SessionState::Ready);
        assert_eq!(sink.events().len(), 4);
        assert_eq!(session.speaker(), 1);

        session
            .handle(SessionEvent::SpeakerChange(serde_json::json!(7)), &mut sink)
            .await;
        assert_eq!(session.speaker(), 7);
        assert_eq!(app.sessions.get(session.id()).unwrap().speaker, 7);
    }

    #[tokio::test]
    async fn test_peer_gone_stops_streaming() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter.clone());
        let mut session = machine(&app, SessionMode::TextToSpeech);
        let mut sink = VecSink::closing_after(5);

        session.handle(SessionEvent::Connect, &mut sink).await;
        let state = session
            .handle(SessionEvent::TextChunk("One. Two. Three.".into()), &mut sink)
            .await;

        assert_eq!(state, SessionState::Ended);
        assert_eq!(sink.messages.len(), 5);
        assert_eq!(converter.converted().len(), 1);
    }

    #[tokio::test]
    async fn test_conversion_only_session() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter.clone());
        let mut session = machine(&app, SessionMode::ConversionOnly);
        let mut sink = VecSink::default();

        let pcm: Vec<u8> = (0..24000)
            .flat_map(|i| ((8000.0 * (i as f32 * 0.1).sin()) as i16).to_le_bytes())
            .collect();

        session.handle(SessionEvent::Connect, &mut sink).await;
        session
            .handle(SessionEvent::AudioChunk(pcm[..24000].to_vec()), &mut sink)
            .await;
        session
            .handle(SessionEvent::AudioChunk(pcm[24000..].to_vec()), &mut sink)
            .await;
        let state = session.handle(SessionEvent::EndOfUtterance, &mut sink).await;

        assert_eq!(state, SessionState::Ended);
        assert_eq!(sink.events(), vec![ServerEvent::Ready, ServerEvent::End]);
        // one second at 24 kHz in 20 ms frames
        assert_eq!(sink.frame_count(), 50);
        assert_eq!(converter.converted(), vec![16000]);
    }

    #[tokio::test]
    async fn test_run_session_releases_registry_entry() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter);
        let session = machine(&app, SessionMode::TextToSpeech);
        assert_eq!(app.sessions.len(), 1);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::TextChunk("Hi".into())).unwrap();
        tx.send(SessionEvent::TextChunk("!".into())).unwrap();
        tx.send(SessionEvent::EndOfUtterance).unwrap();
        drop(tx);

        let mut sink = VecSink::default();
        let state = run_session(session, rx, &mut sink).await;

        assert_eq!(state, SessionState::Ended);
        assert!(app.sessions.is_empty());
        assert_eq!(sink.messages.last(), Some(&Outbound::Close));
        assert_eq!(app.get_metrics_snapshot().sessions_started, 1);
    }

    fn one_shot(app: &AppState) -> SessionStateMachine {
        machine(app, SessionMode::OneShot)
    }

    #[tokio::test]
    async fn test_one_shot_speaks_once_and_closes() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Init(InitRequest {
            text: " Hi! Yo! ".to_string(),
            speaker: Some(serde_json::json!("7")),
        }))
        .unwrap();

        let mut sink = VecSink::default();
        let state = run_one_shot(one_shot(&app), rx, &mut sink, Duration::from_secs(5)).await;

        assert_eq!(state, SessionState::Ended);
        assert_eq!(sink.events(), vec![ServerEvent::Ready, ServerEvent::End]);
        assert_eq!(sink.frame_count(), 23);
        assert_eq!(sink.messages.last(), Some(&Outbound::Close));
        assert!(app.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_empty_text_ends_immediately() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Init(InitRequest::default())).unwrap();

        let mut sink = VecSink::default();
        let state = run_one_shot(one_shot(&app), rx, &mut sink, Duration::from_secs(5)).await;

        assert_eq!(state, SessionState::Ended);
        assert_eq!(
            sink.messages,
            vec![Outbound::Event(ServerEvent::End), Outbound::Close]
        );
        assert!(converter.converted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_times_out_without_request() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter);
        let (_tx, rx) = mpsc::unbounded_channel();

        let mut sink = VecSink::default();
        let state = run_one_shot(one_shot(&app), rx, &mut sink, Duration::from_secs(5)).await;

        assert_eq!(state, SessionState::Ended);
        assert_eq!(
            sink.events(),
            vec![ServerEvent::Error {
                detail: "timeout".to_string()
            }]
        );
        assert_eq!(sink.messages.last(), Some(&Outbound::Close));
    }

    #[tokio::test]
    async fn test_one_shot_rejects_malformed_request() {
        let converter = Arc::new(FakeConverter::new(24000));
        let app = app_with(FakeSynthesizer::new(24000), converter);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Malformed("invalid request: eof".to_string()))
            .unwrap();

        let mut sink = VecSink::default();
        run_one_shot(one_shot(&app), rx, &mut sink, Duration::from_secs(5)).await;

        assert_eq!(
            sink.events(),
            vec![ServerEvent::Error {
                detail: "invalid request: eof".to_string()
            }]
        );
    }
}
