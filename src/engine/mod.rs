//! # Engine Module
//!
//! Adapters for the two external collaborators and the process-wide conversion
//! engine handle every session shares.
//!
//! ## Key Components:
//! - **Synthesizer**: `synthesize(text, voice) -> AudioClip` (VOICEVOX over HTTP)
//! - **VoiceConverter**: `convert(clip, params) -> AudioClip` plus `warm` (remote RVC worker)
//! - **BucketScheduler**: length quantization and the warmed-bucket set
//! - **ConversionEngine**: one mutex around the converter and scheduler so every
//!   convert and warm call in the process is serialized
//!
//! ## Key Rust Concepts Used:
//! - **Trait objects**: `Arc<dyn Synthesizer>` / `Arc<dyn VoiceConverter>` keep the
//!   pipeline independent of the transport and make fakes trivial in tests
//! - **async-trait**: async methods on object-safe traits
//! - **thiserror**: [`EngineError`] with one variant per failure class

pub mod bucket;       // Length quantization and warm tracking
pub mod converter;    // Voice-conversion adapter
pub mod shared;       // Serialized process-wide engine handle
pub mod synthesizer;  // Text-to-speech adapter

pub use bucket::BucketScheduler;
pub use converter::{ConversionParams, HttpVoiceConverter, PitchMethod, Precision, VoiceConverter};
pub use shared::ConversionEngine;
pub use synthesizer::{Synthesizer, Voice, VoicevoxSynthesizer};

use crate::audio::AudioError;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the engine adapters.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The service cannot be reached or reports itself unusable
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The service answered but the request failed
    #[error("engine request failed: {0}")]
    Failed(String),

    /// No answer within the configured budget
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    /// The reply body was not usable audio
    #[error("engine returned unusable audio: {0}")]
    Decode(#[from] AudioError),
}

impl EngineError {
    /// Classify a transport error from `reqwest`.
    pub(crate) fn from_transport(error: reqwest::Error, budget: Duration) -> Self {
        if error.is_connect() {
            EngineError::Unavailable(error.to_string())
        } else if error.is_timeout() {
            EngineError::Timeout(budget)
        } else {
            EngineError::Failed(error.to_string())
        }
    }

    /// True when the engine itself is unusable, not just this one request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }
}

/// Map a non-success HTTP status to an [`EngineError`].
pub(crate) async fn check_status(
    response: reqwest::Response,
    operation: &str,
) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{operation} returned {status}: {}", body.trim());
    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        Err(EngineError::Unavailable(message))
    } else {
        Err(EngineError::Failed(message))
    }
}

/// Test doubles for the engine traits.
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::audio::AudioClip;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Produces a constant-amplitude clip, one sample per character times `samples_per_char`.
    pub struct FakeSynthesizer {
        pub sample_rate: u32,
        pub samples_per_char: usize,
        pub fail_on: Option<String>,
        /// Sleep this long before answering
        pub delay_on: Option<(String, Duration)>,
        pub calls: Mutex<Vec<(String, Voice)>>,
    }

    impl FakeSynthesizer {
        pub fn new(sample_rate: u32) -> Self {
            Self {
                sample_rate,
                samples_per_char: 1600,
                fail_on: None,
                delay_on: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing_on(mut self, text: &str) -> Self {
            self.fail_on = Some(text.to_string());
            self
        }

        pub fn stalling_on(mut self, text: &str, delay: Duration) -> Self {
            self.delay_on = Some((text.to_string(), delay));
            self
        }

        pub fn calls(&self) -> Vec<(String, Voice)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Synthesizer for FakeSynthesizer {
        async fn synthesize(&self, text: &str, voice: Voice) -> Result<AudioClip, EngineError> {
            self.calls.lock().unwrap().push((text.to_string(), voice));
            if let Some((stall_text, delay)) = &self.delay_on {
                if stall_text == text {
                    tokio::time::sleep(*delay).await;
                }
            }
            if self.fail_on.as_deref() == Some(text) {
                return Err(EngineError::Failed(format!("cannot say {text}")));
            }
            let len = text.chars().count() * self.samples_per_char;
            let samples = (0..len)
                .map(|i| 0.5 * (i as f32 * 0.05).sin())
                .collect();
            Ok(AudioClip::new(samples, self.sample_rate))
        }
    }

    /// Echoes its input resampled by sample repetition to `output_rate`.
    pub struct FakeConverter {
        pub output_rate: u32,
        pub unavailable: bool,
        pub converted_lengths: Mutex<Vec<usize>>,
        pub warmed_lengths: Mutex<Vec<usize>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeConverter {
        pub fn new(output_rate: u32) -> Self {
            Self {
                output_rate,
                unavailable: false,
                converted_lengths: Mutex::new(Vec::new()),
                warmed_lengths: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn unavailable(output_rate: u32) -> Self {
            Self {
                unavailable: true,
                ..Self::new(output_rate)
            }
        }

        pub fn converted(&self) -> Vec<usize> {
            self.converted_lengths.lock().unwrap().clone()
        }

        pub fn warmed(&self) -> Vec<usize> {
            self.warmed_lengths.lock().unwrap().clone()
        }

        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl VoiceConverter for FakeConverter {
        async fn convert(
            &self,
            clip: AudioClip,
            _params: &ConversionParams,
        ) -> Result<AudioClip, EngineError> {
            if self.unavailable {
                return Err(EngineError::Unavailable("worker is down".to_string()));
            }
            self.enter().await;
            self.converted_lengths.lock().unwrap().push(clip.len());
            let out_len = (clip.len() as u64 * self.output_rate as u64
                / clip.sample_rate.max(1) as u64) as usize;
            let samples = (0..out_len)
                .map(|i| clip.samples[i * clip.len() / out_len.max(1)])
                .collect();
            Ok(AudioClip::new(samples, self.output_rate))
        }

        async fn warm(&self, clip: AudioClip, _params: &ConversionParams) -> Result<(), EngineError> {
            if self.unavailable {
                return Err(EngineError::Unavailable("worker is down".to_string()));
            }
            self.enter().await;
            self.warmed_lengths.lock().unwrap().push(clip.len());
            Ok(())
        }
    }
}
