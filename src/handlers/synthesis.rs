//! # One-shot Synthesis Handler
//!
//! `POST /tts` renders a whole utterance and answers with a single WAV file.
//!
//! ## Request:
//! ```json
//! { "text": "Hello there. How are you?", "speaker": 3, "speed": 1.2, "convert": true }
//! ```
//!
//! ## Response:
//! `audio/wav` (16-bit PCM, mono) with timing headers:
//! - `X-Synth-ms`: total synthesis time
//! - `X-Convert-ms`: total conversion time
//! - `X-Total-ms`: wall time of the request
//! - `X-Snr-dB`: segmental SNR of the result (`nan` when undefined)
//!
//! The text is segmented with a forced flush and each segment rendered the
//! same way a streaming session would, then the segments are joined with the
//! configured gap.

use crate::audio::{codec, quality, AudioClip};
use crate::engine::Voice;
use crate::error::AppError;
use crate::segmenter::append_and_extract;
use crate::session::pipeline::{SegmentError, VoicePipeline};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::time::Instant;
use tracing::{info, warn};

/// Request body for `POST /tts`.
#[derive(Debug, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    /// Defaults to the configured speaker
    pub speaker: Option<u32>,
    /// Speaking-rate multiplier; the engine default when absent
    pub speed: Option<f32>,
    /// Skip voice conversion when false
    #[serde(default = "default_convert", alias = "rvc_enable")]
    pub convert: bool,
}

fn default_convert() -> bool {
    true
}

/// A rendered utterance and its timing totals.
#[derive(Debug)]
pub struct Utterance {
    pub clip: AudioClip,
    pub synth_ms: u64,
    pub convert_ms: u64,
    pub segments_rendered: usize,
    pub segments_dropped: usize,
}

/// Segment `text`, render every segment and join them with the gap.
///
/// ## Returns:
/// - **Err(ValidationError)**: Nothing speakable in `text`
/// - **Err(Unavailable)**: The conversion engine is unusable
/// - **Err(Upstream)**: Every segment failed
pub async fn render_utterance(
    pipeline: &VoicePipeline,
    state: &AppState,
    text: &str,
    voice: Voice,
    convert: bool,
) -> Result<Utterance, AppError> {
    let min_chars = pipeline.settings().min_segment_chars;
    let segments: Vec<_> = append_and_extract("", text, true)
        .segments
        .into_iter()
        .filter(|s| s.char_len() >= min_chars)
        .collect();

    if segments.is_empty() {
        return Err(AppError::ValidationError("text has nothing to speak".to_string()));
    }

    let mut combined: Option<AudioClip> = None;
    let mut synth_ms = 0;
    let mut convert_ms = 0;
    let mut rendered_count = 0;
    let mut dropped = 0;
    let mut last_error: Option<SegmentError> = None;

    for segment in &segments {
        let result = if convert {
            pipeline.render_text(segment.as_str(), voice).await.map(|rendered| {
                state.record_segment_rendered(0, rendered.warmed, rendered.length_mismatch);
                (rendered.clip, rendered.timings.synth_ms, rendered.timings.convert_ms)
            })
        } else {
            let started = Instant::now();
            pipeline
                .synthesize(segment.as_str(), voice)
                .await
                .map(|clip| (clip, started.elapsed().as_millis() as u64, 0))
        };

        match result {
            Ok((clip, segment_synth_ms, segment_convert_ms)) => {
                synth_ms += segment_synth_ms;
                convert_ms += segment_convert_ms;
                rendered_count += 1;
                combined = Some(match combined {
                    None => clip,
                    Some(mut joined) => {
                        let clip = if clip.sample_rate == joined.sample_rate {
                            clip
                        } else {
                            pipeline
                                .resample(clip, joined.sample_rate)
                                .map_err(|e| AppError::Internal(e.to_string()))?
                        };
                        joined.extend(&pipeline.gap(joined.sample_rate));
                        joined.extend(&clip);
                        joined
                    }
                });
            }
            Err(err) if err.is_fatal() => {
                return Err(AppError::Unavailable(err.to_string()));
            }
            Err(err) => {
                warn!(segment = %segment, error = %err, "Segment dropped");
                state.record_segment_dropped();
                dropped += 1;
                last_error = Some(err);
            }
        }
    }

    match combined {
        Some(clip) => Ok(Utterance {
            clip,
            synth_ms,
            convert_ms,
            segments_rendered: rendered_count,
            segments_dropped: dropped,
        }),
        None => Err(AppError::Upstream(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no segment could be rendered".to_string()),
        )),
    }
}

/// Render text to a WAV file.
///
/// ## Endpoint: `POST /tts`
pub async fn synthesize(
    app_state: web::Data<AppState>,
    body: web::Json<SynthesisRequest>,
) -> Result<HttpResponse, AppError> {
    let started = Instant::now();
    let request = body.into_inner();
    let config = app_state.get_config();

    if request.text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }

    let speaker = request.speaker.unwrap_or(config.synthesis.default_speaker);
    if !config.synthesis.is_allowed(speaker) {
        return Err(AppError::ValidationError(format!("speaker {speaker} is not allowed")));
    }
    if let Some(speed) = request.speed {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(AppError::ValidationError(format!("speed {speed} must be positive")));
        }
    }
    let voice = Voice::new(speaker).with_speed(request.speed);

    let pipeline = app_state.pipeline.clone().ok_or_else(|| {
        AppError::Unavailable(
            app_state
                .engine_error
                .clone()
                .unwrap_or_else(|| "voice pipeline unavailable".to_string()),
        )
    })?;

    let utterance =
        render_utterance(&pipeline, &app_state, &request.text, voice, request.convert).await?;

    let snr_db = quality::segmental_snr(&utterance.clip, &quality::SnrOptions::default());
    let wav = codec::encode_wav_pcm16(&utterance.clip)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let total_ms = started.elapsed().as_millis() as u64;

    info!(
        speaker = speaker,
        speed = request.speed,
        convert = request.convert,
        segments = utterance.segments_rendered,
        dropped = utterance.segments_dropped,
        audio_ms = utterance.clip.duration_ms() as u64,
        synth_ms = utterance.synth_ms,
        convert_ms = utterance.convert_ms,
        total_ms = total_ms,
        "Utterance synthesized"
    );

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(("X-Synth-ms", utterance.synth_ms.to_string()))
        .insert_header(("X-Convert-ms", utterance.convert_ms.to_string()))
        .insert_header(("X-Total-ms", total_ms.to_string()))
        .insert_header(("X-Snr-dB", format_snr(snr_db)))
        .body(wav))
}

fn format_snr(snr_db: f64) -> String {
    if snr_db.is_finite() {
        format!("{snr_db:.2}")
    } else {
        "nan".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::fakes::{FakeConverter, FakeSynthesizer};
    use crate::session::pipeline::tests::{pipeline_with, shared_pipeline};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn state_with(synthesizer: FakeSynthesizer, converter: FakeConverter) -> AppState {
        let pipeline = pipeline_with(synthesizer, Arc::new(converter));
        AppState::new(AppConfig::default(), Ok(Arc::new(pipeline)))
    }

    #[tokio::test]
    async fn test_segments_joined_with_gap() {
        let state = state_with(FakeSynthesizer::new(24000), FakeConverter::new(24000));
        let pipeline = state.pipeline.clone().unwrap();

        let utterance = render_utterance(&pipeline, &state, "Hi! Yo!", Voice::new(1), true).await.unwrap();

        // 4800 + 1200 gap + 4800
        assert_eq!(utterance.clip.len(), 10800);
        assert_eq!(utterance.segments_rendered, 2);
        assert_eq!(state.get_metrics_snapshot().segments_rendered, 2);
    }

    #[tokio::test]
    async fn test_unconverted_output_is_raw_synthesis() {
        let converter = Arc::new(FakeConverter::new(48000));
        let pipeline = pipeline_with(FakeSynthesizer::new(24000), converter.clone());
        let state = AppState::new(AppConfig::default(), Ok(Arc::new(pipeline)));
        let pipeline = state.pipeline.clone().unwrap();

        let utterance = render_utterance(&pipeline, &state, "Hello", Voice::new(1), false).await.unwrap();

        assert_eq!(utterance.clip.sample_rate, 24000);
        assert_eq!(utterance.clip.len(), 8000);
        assert_eq!(utterance.convert_ms, 0);
        assert!(converter.converted().is_empty());
    }

    #[tokio::test]
    async fn test_failures_map_to_http_errors() {
        let state = state_with(
            FakeSynthesizer::new(24000).failing_on("Hi!"),
            FakeConverter::new(24000),
        );
        let pipeline = state.pipeline.clone().unwrap();
        assert!(matches!(
            render_utterance(&pipeline, &state, "Hi!", Voice::new(1), true).await,
            Err(AppError::Upstream(_))
        ));
        assert!(matches!(
            render_utterance(&pipeline, &state, " ! ", Voice::new(1), true).await,
            Err(AppError::ValidationError(_))
        ));

        let state = state_with(FakeSynthesizer::new(24000), FakeConverter::unavailable(24000));
        let pipeline = state.pipeline.clone().unwrap();
        assert!(matches!(
            render_utterance(&pipeline, &state, "Hello.", Voice::new(1), true).await,
            Err(AppError::Unavailable(_))
        ));
    }

    #[actix_web::test]
    async fn test_tts_endpoint_returns_wav_with_timings() {
        let state = web::Data::new(state_with(
            FakeSynthesizer::new(24000),
            FakeConverter::new(24000),
        ));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/tts", web::post().to(synthesize)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/tts")
            .set_json(serde_json::json!({"text": "Hello there."}))
            .to_request();
        let response = test::call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "audio/wav");
        for header in ["X-Synth-ms", "X-Convert-ms", "X-Total-ms", "X-Snr-dB"] {
            assert!(response.headers().contains_key(header), "missing {header}");
        }

        let body = test::read_body(response).await;
        let clip = codec::decode_wav(&body).unwrap();
        assert_eq!(clip.sample_rate, 24000);
        assert_eq!(clip.len(), 12 * 1600);
    }

    #[actix_web::test]
    async fn test_tts_endpoint_passes_speed_to_synthesis() {
        let synthesizer = Arc::new(FakeSynthesizer::new(24000));
        let pipeline = shared_pipeline(synthesizer.clone(), Arc::new(FakeConverter::new(24000)));
        let state = web::Data::new(AppState::new(AppConfig::default(), Ok(Arc::new(pipeline))));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/tts", web::post().to(synthesize)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/tts")
            .set_json(serde_json::json!({"text": "Hello.", "speed": 1.5, "rvc_enable": false}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let calls = synthesizer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, Voice::new(1).with_speed(Some(1.5)));

        let request = test::TestRequest::post()
            .uri("/tts")
            .set_json(serde_json::json!({"text": "Hello.", "speed": -1.0}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_tts_endpoint_degraded() {
        let state = web::Data::new(AppState::new(AppConfig::default(), Err("down".to_string())));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/tts", web::post().to(synthesize)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/tts")
            .set_json(serde_json::json!({"text": "Hello"}))
            .to_request();
        let response = test::call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
