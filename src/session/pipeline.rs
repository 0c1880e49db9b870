//! # Segment Rendering Pipeline
//!
//! Turns one unit of work into a conditioned clip ready for packetizing:
//!
//! ```text
//! text ──synthesize──► clip ─┐
//!                            ├─► preprocess ─► engine (bucketed) ─► postprocess ─► clip
//! recorded PCM ──normalize───┘
//! ```
//!
//! Every step returns an explicit [`SegmentError`]; the session decides from
//! [`SegmentError::is_fatal`] whether to drop the segment or end the session.
//!
//! With `streaming.debug_dump_dir` set, each stage of every segment is also
//! written to disk as `<n>_<stage>.wav` (`synth`, `input`, `pre`, `raw`, `final`).

use crate::audio::{
    codec,
    conditioner::AudioConditioner,
    packetizer::FramePacketizer,
    quality::{segmental_snr, SnrOptions},
    samples_for_ms, AudioClip, AudioError,
};
use crate::config::AppConfig;
use crate::engine::{ConversionEngine, EngineError, Synthesizer, Voice};
use crate::error::StreamError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Session-independent knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub synth_timeout: Duration,
    pub frame_ms: u32,
    pub segment_gap_ms: u32,
    pub min_segment_chars: usize,
    pub length_tolerance_ms: u32,
    pub conversion_input_rate: u32,
    pub conversion_input_level: f32,
    pub debug_dump_dir: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            synth_timeout: config.synthesis.timeout(),
            frame_ms: config.streaming.frame_ms,
            segment_gap_ms: config.streaming.segment_gap_ms,
            min_segment_chars: config.streaming.min_segment_chars,
            length_tolerance_ms: config.streaming.length_tolerance_ms,
            conversion_input_rate: config.streaming.conversion_input_rate,
            conversion_input_level: config.streaming.conversion_input_level,
            debug_dump_dir: config.streaming.debug_dump_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// Why one segment could not be rendered.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("synthesis failed: {0}")]
    Synthesis(EngineError),

    #[error("synthesis returned no audio")]
    EmptySynthesis,

    #[error("voice conversion failed: {0}")]
    Conversion(EngineError),

    #[error("audio conditioning failed: {0}")]
    Conditioning(#[from] AudioError),
}

impl SegmentError {
    /// Only an unusable conversion engine ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SegmentError::Conversion(e) if e.is_unavailable())
    }
}

impl From<SegmentError> for StreamError {
    fn from(err: SegmentError) -> Self {
        if err.is_fatal() {
            StreamError::FatalSession(err.to_string())
        } else {
            StreamError::TransientSegment(err.to_string())
        }
    }
}

/// Timing breakdown of one rendered segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentTimings {
    pub synth_ms: u64,
    pub convert_ms: u64,
}

/// A conditioned clip plus diagnostics.
#[derive(Debug, Clone)]
pub struct RenderedSegment {
    pub clip: AudioClip,
    pub timings: SegmentTimings,
    /// Whether the engine output length missed the padded input's by more than the tolerance
    pub length_mismatch: bool,
    /// Whether a bucket had to be warmed for this segment
    pub warmed: bool,
    /// Segmental SNR of the output, NaN when undefined
    pub snr_db: f64,
}

/// Writes intermediate clips for offline listening.
struct StageDump {
    dir: PathBuf,
    next: AtomicU64,
}

impl StageDump {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Best-effort: failures are logged and otherwise ignored.
    async fn write(&self, id: u64, stage: &str, clip: &AudioClip) {
        let bytes = match codec::encode_wav_f32(clip) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(stage = stage, error = %e, "Could not encode debug clip");
                return;
            }
        };
        let path = self.dir.join(format!("{id:05}_{stage}.wav"));
        let result = match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => tokio::fs::write(&path, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Could not write debug clip");
        }
    }
}

/// Shared, stateless renderer used by every session.
pub struct VoicePipeline {
    synthesizer: Arc<dyn Synthesizer>,
    engine: Arc<ConversionEngine>,
    conditioner: AudioConditioner,
    settings: PipelineSettings,
    dump: Option<StageDump>,
}

impl VoicePipeline {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        engine: Arc<ConversionEngine>,
        conditioner: AudioConditioner,
        settings: PipelineSettings,
    ) -> Self {
        let dump = settings.debug_dump_dir.clone().map(|dir| {
            info!(dir = %dir.display(), "Writing per-stage debug audio");
            StageDump {
                dir,
                next: AtomicU64::new(0),
            }
        });
        Self {
            synthesizer,
            engine,
            conditioner,
            settings,
            dump,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn engine(&self) -> &ConversionEngine {
        &self.engine
    }

    /// Call the synthesis service, bounded by the configured timeout.
    pub async fn synthesize(&self, text: &str, voice: Voice) -> Result<AudioClip, SegmentError> {
        let budget = self.settings.synth_timeout;
        let clip = tokio::time::timeout(budget, self.synthesizer.synthesize(text, voice))
            .await
            .map_err(|_| SegmentError::Synthesis(EngineError::Timeout(budget)))?
            .map_err(SegmentError::Synthesis)?;

        if clip.is_empty() {
            return Err(SegmentError::EmptySynthesis);
        }
        Ok(clip)
    }

    /// Synthesize `text` and convert it to the target voice.
    pub async fn render_text(
        &self,
        text: &str,
        voice: Voice,
    ) -> Result<RenderedSegment, SegmentError> {
        let synth_start = Instant::now();
        let synthesized = self.synthesize(text, voice).await?;
        let synth_ms = synth_start.elapsed().as_millis() as u64;

        let dump_id = self.dump_id();
        self.dump(dump_id, "synth", &synthesized).await;
        self.convert(synthesized, synth_ms, dump_id).await
    }

    /// Convert a peer recording (conversion-only sessions).
    ///
    /// Returns `Ok(None)` when the recording is too quiet to be worth converting.
    pub async fn render_recording(
        &self,
        recording: AudioClip,
    ) -> Result<Option<RenderedSegment>, SegmentError> {
        let level = self.settings.conversion_input_level;
        let dump_id = self.dump_id();
        self.dump(dump_id, "input", &recording).await;
        match self.conditioner.normalize_input(recording, level) {
            Some(normalized) => self.convert(normalized, 0, dump_id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn convert(
        &self,
        clip: AudioClip,
        synth_ms: u64,
        dump_id: Option<u64>,
    ) -> Result<RenderedSegment, SegmentError> {
        let internal_rate = self.engine.internal_rate();
        let prepared = self.conditioner.preprocess(clip, internal_rate)?;
        self.dump(dump_id, "pre", &prepared).await;

        let convert_start = Instant::now();
        let outcome = self
            .engine
            .convert(prepared)
            .await
            .map_err(SegmentError::Conversion)?;
        let convert_ms = convert_start.elapsed().as_millis() as u64;

        let output_rate = outcome.clip.sample_rate;
        let expected_len =
            AudioConditioner::expected_len(outcome.input_len, output_rate, internal_rate);

        // Bucket padding lengthens the output on purpose; only the engine's own
        // deviation from the padded length is worth reporting
        let padded_len =
            AudioConditioner::expected_len(outcome.bucket_len, output_rate, internal_rate);
        let length_delta = outcome.clip.len() as i64 - padded_len as i64;
        let tolerance = samples_for_ms(output_rate, self.settings.length_tolerance_ms) as i64;
        let length_mismatch = length_delta.abs() > tolerance;

        self.dump(dump_id, "raw", &outcome.clip).await;
        let clip = self.conditioner.postprocess(outcome.clip, expected_len);
        self.dump(dump_id, "final", &clip).await;
        if length_mismatch {
            warn!(
                expected_samples = padded_len,
                delta_samples = length_delta,
                bucket_len = outcome.bucket_len,
                output_rate = output_rate,
                "Engine output length differs from expected length"
            );
        }

        let snr_db = segmental_snr(&clip, &SnrOptions::default());
        debug!(snr_db = snr_db, samples = clip.len(), "Segment signal quality");

        Ok(RenderedSegment {
            clip,
            timings: SegmentTimings {
                synth_ms,
                convert_ms,
            },
            length_mismatch,
            warmed: outcome.warmed,
            snr_db,
        })
    }

    fn dump_id(&self) -> Option<u64> {
        self.dump.as_ref().map(StageDump::next_id)
    }

    async fn dump(&self, id: Option<u64>, stage: &str, clip: &AudioClip) {
        if let (Some(dump), Some(id)) = (&self.dump, id) {
            dump.write(id, stage, clip).await;
        }
    }

    /// Packetizer producing frames of the configured duration at `sample_rate`.
    pub fn packetizer(&self, sample_rate: u32) -> FramePacketizer {
        FramePacketizer::for_duration(sample_rate, self.settings.frame_ms)
    }

    /// Silence inserted between consecutive segments.
    pub fn gap(&self, sample_rate: u32) -> AudioClip {
        AudioClip::silence(
            samples_for_ms(sample_rate, self.settings.segment_gap_ms),
            sample_rate,
        )
    }

    /// Resample helper for callers stitching clips of different rates.
    pub fn resample(&self, clip: AudioClip, sample_rate: u32) -> Result<AudioClip, AudioError> {
        self.conditioner.resample(clip, sample_rate)
    }
}
