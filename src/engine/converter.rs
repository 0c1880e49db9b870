//! # Voice-Conversion Adapter
//!
//! The conversion engine is reached through the [`VoiceConverter`] trait. The
//! production implementation, [`HttpVoiceConverter`], talks to a dedicated
//! inference worker process that owns the model:
//!
//! | Route          | Body                  | Reply                |
//! |----------------|-----------------------|----------------------|
//! | `GET /health`  | none                  | 200 when the model is loaded |
//! | `POST /convert`| mono f32 WAV at the internal rate | converted WAV |
//! | `POST /warm`   | zero-filled f32 WAV   | 2xx, body ignored    |
//!
//! Control parameters travel in the query string.

use super::{check_status, EngineError};
use crate::audio::{codec, AudioClip};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Pitch-extraction algorithm used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PitchMethod {
    Rmvpe,
    Crepe,
    Harvest,
    Pm,
}

/// Numeric precision the engine runs inference in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    Full,
}

/// Control parameters sent with every convert and warm call.
///
/// Fixed at startup from configuration; sessions never modify them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionParams {
    /// Pitch shift in semitones
    pub pitch_shift: i32,
    pub pitch_method: PitchMethod,
    /// Optional retrieval index on the worker's filesystem
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<String>,
    /// Blend between index features and source features (0..=1)
    pub index_rate: f32,
    /// Unvoiced consonant protection (0..=0.5 meaningful)
    pub protect: f32,
    /// Median filter radius applied to the pitch curve
    pub filter_radius: u32,
    /// Output loudness envelope mix (0 keeps the source envelope)
    pub rms_mix_rate: f32,
    /// Output rate override; values below 16000 mean "engine target rate"
    pub resample_rate: u32,
    pub precision: Precision,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self {
            pitch_shift: 0,
            pitch_method: PitchMethod::Rmvpe,
            index_path: None,
            index_rate: 0.8,
            protect: 0.75,
            filter_radius: 5,
            rms_mix_rate: 0.0,
            resample_rate: 24000,
            precision: Precision::Half,
        }
    }
}

/// The voice-conversion engine as seen by the pipeline.
///
/// Implementations need not be safe for concurrent use by themselves;
/// [`super::ConversionEngine`] serializes every call.
#[async_trait]
pub trait VoiceConverter: Send + Sync {
    /// Convert `clip` (at the engine's internal rate) to the target voice.
    async fn convert(&self, clip: AudioClip, params: &ConversionParams)
        -> Result<AudioClip, EngineError>;

    /// Run a throwaway inference so the engine allocates buffers for this length.
    async fn warm(&self, clip: AudioClip, params: &ConversionParams) -> Result<(), EngineError>;
}

/// [`VoiceConverter`] backed by a remote inference worker.
pub struct HttpVoiceConverter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpVoiceConverter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Failed(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Check that the worker is up and has its model loaded.
    pub async fn probe(&self) -> Result<(), EngineError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        check_status(response, "health")
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        info!(url = %self.base_url, "Voice-conversion worker is ready");
        Ok(())
    }

    async fn post_clip(
        &self,
        route: &str,
        clip: &AudioClip,
        params: &ConversionParams,
    ) -> Result<reqwest::Response, EngineError> {
        let body = codec::encode_wav_f32(clip)?;

        let response = self
            .client
            .post(format!("{}/{}", self.base_url, route))
            .query(params)
            .header(CONTENT_TYPE, "audio/wav")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::from_transport(e, self.timeout))?;

        check_status(response, route).await
    }
}

#[async_trait]
impl VoiceConverter for HttpVoiceConverter {
    async fn convert(
        &self,
        clip: AudioClip,
        params: &ConversionParams,
    ) -> Result<AudioClip, EngineError> {
        let input_len = clip.len();
        let response = self.post_clip("convert", &clip, params).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::from_transport(e, self.timeout))?;

        let converted = codec::decode_wav(&bytes)?;
        debug!(
            input_samples = input_len,
            output_samples = converted.len(),
            output_rate = converted.sample_rate,
            "Conversion call returned"
        );
        Ok(converted)
    }

    async fn warm(&self, clip: AudioClip, params: &ConversionParams) -> Result<(), EngineError> {
        self.post_clip("warm", &clip, params).await?;
        Ok(())
    }
}
