//! # Speech Synthesis Adapter
//!
//! [`Synthesizer`] turns text into a waveform. [`VoicevoxSynthesizer`] drives a
//! VOICEVOX engine over its two-step HTTP API:
//!
//! 1. `POST /audio_query?text=..&speaker=..` returns a JSON synthesis query
//! 2. The query is patched (output rate, mono, optional speed) and posted to
//!    `POST /synthesis?speaker=..`, which returns a WAV file

use super::{check_status, EngineError};
use crate::audio::{codec, AudioClip};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Who speaks, and how fast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voice {
    pub speaker: u32,
    /// Speaking-rate multiplier; `None` keeps the engine default
    pub speed: Option<f32>,
}

impl Voice {
    pub fn new(speaker: u32) -> Self {
        Self { speaker, speed: None }
    }

    pub fn with_speed(mut self, speed: Option<f32>) -> Self {
        self.speed = speed;
        self
    }
}

/// Text-to-speech as seen by the pipeline.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Voice) -> Result<AudioClip, EngineError>;
}

/// [`Synthesizer`] backed by a VOICEVOX engine.
pub struct VoicevoxSynthesizer {
    client: reqwest::Client,
    base_url: String,
    output_rate: u32,
    timeout: Duration,
}

impl VoicevoxSynthesizer {
    /// ## Parameters:
    /// - `base_url`: engine root, e.g. `http://127.0.0.1:50021`
    /// - `output_rate`: sample rate requested from the engine
    /// - `connect_timeout`, `timeout`: transport-level bounds on each HTTP request
    pub fn new(
        base_url: impl Into<String>,
        output_rate: u32,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Failed(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            output_rate,
            timeout,
        })
    }

    /// Ask the engine to load a speaker's model ahead of the first request.
    ///
    /// Best-effort: failures are logged and otherwise ignored.
    pub async fn initialize_speaker(&self, speaker: u32) {
        let result = self
            .client
            .post(format!("{}/initialize_speaker", self.base_url))
            .query(&[("speaker", speaker.to_string()), ("skip_reinit", "true".to_string())])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(speaker = speaker, "Synthesis speaker initialized");
            }
            Ok(response) => {
                warn!(speaker = speaker, status = %response.status(), "Speaker initialization rejected");
            }
            Err(e) => {
                warn!(speaker = speaker, error = %e, "Speaker initialization failed");
            }
        }
    }

    async fn audio_query(&self, text: &str, speaker: u32) -> Result<Value, EngineError> {
        let response = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", text.to_string()), ("speaker", speaker.to_string())])
            .send()
            .await
            .map_err(|e| EngineError::from_transport(e, self.timeout))?;

        let response = check_status(response, "audio_query").await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::Failed(format!("audio_query returned invalid json: {e}")))
    }
}

#[async_trait]
impl Synthesizer for VoicevoxSynthesizer {
    async fn synthesize(&self, text: &str, voice: Voice) -> Result<AudioClip, EngineError> {
        let speaker = voice.speaker;
        let mut query = self.audio_query(text, speaker).await?;
        patch_query(&mut query, self.output_rate, voice.speed)?;

        let response = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.to_string())])
            .json(&query)
            .send()
            .await
            .map_err(|e| EngineError::from_transport(e, self.timeout))?;

        let response = check_status(response, "synthesis").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::from_transport(e, self.timeout))?;

        let clip = codec::decode_wav(&bytes)?;
        debug!(
            speaker = speaker,
            samples = clip.len(),
            sample_rate = clip.sample_rate,
            "Synthesis returned"
        );
        Ok(clip)
    }
}

/// Request mono output at `output_rate`, and `speed` when given.
fn patch_query(query: &mut Value, output_rate: u32, speed: Option<f32>) -> Result<(), EngineError> {
    let fields = query
        .as_object_mut()
        .ok_or_else(|| EngineError::Failed("audio_query did not return an object".to_string()))?;
    fields.insert("outputSamplingRate".to_string(), Value::from(output_rate));
    fields.insert("outputStereo".to_string(), Value::Bool(false));
    if let Some(speed) = speed {
        fields.insert("speedScale".to_string(), Value::from(speed));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_query_sets_rate_and_mono() {
        let mut query = json!({"speedScale": 1.0, "outputSamplingRate": 48000, "outputStereo": true});
        patch_query(&mut query, 24000, None).unwrap();
        assert_eq!(query["outputSamplingRate"], 24000);
        assert_eq!(query["outputStereo"], false);
        assert_eq!(query["speedScale"], 1.0);
    }

    #[test]
    fn test_patch_query_sets_speed() {
        let mut query = json!({"speedScale": 1.0, "pitchScale": 0.0});
        patch_query(&mut query, 24000, Some(1.25)).unwrap();
        assert_eq!(query["speedScale"], 1.25);
        assert_eq!(query["pitchScale"], 0.0);
    }

    #[test]
    fn test_patch_query_rejects_non_object() {
        let mut query = json!(["not", "a", "query"]);
        assert!(matches!(patch_query(&mut query, 24000, None), Err(EngineError::Failed(_))));
    }
}
