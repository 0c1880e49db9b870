//! # Audio Processing Module
//!
//! Waveform handling for the streaming voice pipeline. Everything in here is
//! pure computation over sample buffers: no network, no locks, no sessions.
//!
//! ## Key Components:
//! - **AudioClip**: Mono float samples plus their sample rate
//! - **Codec**: WAV and raw PCM16 conversion at the engine and wire boundaries
//! - **Conditioner**: Resampling, DC removal, peak limiting, padding, cropping, fades
//! - **Packetizer**: Slices conditioned audio into fixed-size PCM16 wire frames
//! - **Quality**: Segmental SNR estimate used for diagnostics
//!
//! ## Audio Format Conventions:
//! - **Samples**: `f32`, nominally in [-1.0, 1.0]
//! - **Channels**: Mono only (multi-channel input is mixed down on decode)
//! - **Wire format**: 16-bit little-endian signed PCM

pub mod codec;        // WAV / PCM16 encode and decode
pub mod conditioner;  // Pre/post conversion normalization
pub mod packetizer;   // Fixed-duration wire frames
pub mod quality;      // Segmental SNR estimator

use thiserror::Error;

/// Errors raised while transforming or decoding audio.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The band-limited resampler rejected the input or its parameters
    #[error("resampling failed: {0}")]
    Resample(String),

    /// A WAV payload could not be parsed
    #[error("invalid wav data: {0}")]
    Wav(String),

    /// Raw PCM16 payloads must contain whole samples
    #[error("pcm payload must contain whole 16-bit samples, got {0} bytes")]
    OddPcmLength(usize),
}

/// A mono waveform passed by value through the pipeline stages.
///
/// ## Ownership:
/// Clips are never shared. Each stage takes the clip by value and hands a new
/// (or mutated) clip to the next one, so no stage can observe another's edits.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Amplitudes, nominally in [-1.0, 1.0]
    pub samples: Vec<f32>,

    /// Samples per second
    pub sample_rate: u32,
}

impl AudioClip {
    /// Create a clip from samples at the given rate.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A zero-filled clip of `len` samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    /// Number of samples in the clip.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of the clip in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Largest absolute amplitude, ignoring non-finite samples.
    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    /// Append another clip recorded at the same rate.
    pub fn extend(&mut self, other: &AudioClip) {
        self.samples.extend_from_slice(&other.samples);
    }
}

/// Largest absolute finite amplitude of a sample slice.
pub(crate) fn peak(samples: &[f32]) -> f32 {
    samples
        .iter()
        .filter(|s| s.is_finite())
        .fold(0.0_f32, |acc, s| acc.max(s.abs()))
}

/// Number of samples covering `ms` milliseconds at `sample_rate`.
pub fn samples_for_ms(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}
