//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix and `__` between section and key)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: The same structs are loaded from TOML/env and reported as JSON
//! - **derive macros**: `Debug`, `Clone`, `Serialize`, `Deserialize` on every section
//! - **Result<T, E>**: Loading and validation fail early with `anyhow` errors
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_CONVERSION__PITCH_SHIFT`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! Everything here is read once at startup and fixed for the lifetime of the
//! process; sessions take their options from it at construction.

use crate::audio::conditioner::ConditionerSettings;
use crate::engine::{ConversionParams, PitchMethod, Precision};
use anyhow::Result;                   // Error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, env
use std::env;                         // For HOST / PORT overrides
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub synthesis: SynthesisConfig,
    pub conversion: ConversionConfig,
    pub streaming: StreamingConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech synthesis service (VOICEVOX) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Engine root URL
    pub url: String,

    /// Speaker used when a session does not pick one
    pub default_speaker: u32,

    /// Speakers sessions may switch to; empty means any
    #[serde(default)]
    pub allowed_speakers: Vec<u32>,

    /// Output sample rate requested from the engine
    pub sample_rate: u32,

    pub connect_timeout_ms: u64,

    /// Upper bound on one synthesis call, after which the segment is dropped
    pub timeout_ms: u64,
}

/// Voice-conversion engine settings.
///
/// ## Fields:
/// - `engine_url`: Root URL of the inference worker
/// - `required`: Refuse to start when the worker cannot be reached
/// - `internal_rate`: Sample rate the engine expects its input at
/// - `pitch_shift` .. `precision`: Control parameters sent with every call
/// - `bucketing`, `bucket_size`: Length quantization to amortize cold starts
/// - `prewarm_lengths`: Input lengths (samples) warmed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub engine_url: String,
    pub required: bool,
    pub internal_rate: u32,
    pub pitch_shift: i32,
    pub pitch_method: PitchMethod,
    #[serde(default)]
    pub index_path: Option<String>,
    pub index_rate: f32,
    pub protect: f32,
    pub filter_radius: u32,
    pub rms_mix_rate: f32,
    pub resample_rate: u32,
    pub precision: Precision,
    pub bucketing: bool,
    pub bucket_size: usize,
    #[serde(default)]
    pub prewarm_lengths: Vec<usize>,
    pub timeout_ms: u64,
}

/// Session streaming and audio cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Duration of one outbound PCM frame
    pub frame_ms: u32,

    /// Silence inserted between consecutive segments of one utterance
    pub segment_gap_ms: u32,

    /// Segments shorter than this (in characters) are not synthesized
    pub min_segment_chars: usize,

    pub fade_ceiling_samples: usize,
    pub noise_gate: f32,
    pub output_peak: f32,

    /// Engine output length discrepancy worth a warning
    pub length_tolerance_ms: u32,

    /// Sample rate of raw PCM pushed on conversion-only sockets
    pub conversion_input_rate: u32,

    /// Peak level conversion-only input is normalized to
    pub conversion_input_level: f32,

    /// When set, every rendered segment is also written here as per-stage WAV files
    #[serde(default)]
    pub debug_dump_dir: Option<String>,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of WebSocket sessions served at once
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let params = ConversionParams::default();
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            synthesis: SynthesisConfig {
                url: "http://127.0.0.1:50021".to_string(),
                default_speaker: 1,
                allowed_speakers: Vec::new(),
                sample_rate: 24000,
                connect_timeout_ms: 10_000,
                timeout_ms: 30_000,
            },
            conversion: ConversionConfig {
                engine_url: "http://127.0.0.1:6242".to_string(),
                required: true,
                internal_rate: 16000,
                pitch_shift: params.pitch_shift,
                pitch_method: params.pitch_method,
                index_path: params.index_path,
                index_rate: params.index_rate,
                protect: params.protect,
                filter_radius: params.filter_radius,
                rms_mix_rate: params.rms_mix_rate,
                resample_rate: params.resample_rate,
                precision: params.precision,
                bucketing: true,
                bucket_size: 8000,  // 500 ms at 16 kHz
                prewarm_lengths: vec![8000, 16000, 24000, 32000],
                timeout_ms: 60_000,
            },
            streaming: StreamingConfig {
                frame_ms: 20,
                segment_gap_ms: 50,
                min_segment_chars: 2,
                fade_ceiling_samples: 240,
                noise_gate: 0.001,
                output_peak: 0.99,
                length_tolerance_ms: 10,
                conversion_input_rate: 24000,
                conversion_input_level: 0.7,
                debug_dump_dir: None,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SYNTHESIS__URL=http://voicevox:50021`: Point at another engine
    /// - `APP_CONVERSION__PREWARM_LENGTHS=8000,16000`: Lists are comma separated
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("synthesis.allowed_speakers")
                    .with_list_parse_key("conversion.prewarm_lengths")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 and at least one session is allowed
    /// - Sample rates and frame duration are non-zero
    /// - Ratios are within [0, 1]
    /// - The default speaker is permitted by a non-empty allow list
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.conversion.internal_rate == 0 {
            return Err(anyhow::anyhow!("Conversion internal rate must be greater than 0"));
        }

        if self.synthesis.sample_rate == 0 || self.streaming.conversion_input_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.streaming.frame_ms == 0 {
            return Err(anyhow::anyhow!("Frame duration must be greater than 0"));
        }

        let ratios = [
            ("conversion.index_rate", self.conversion.index_rate),
            ("conversion.protect", self.conversion.protect),
            ("conversion.rms_mix_rate", self.conversion.rms_mix_rate),
            ("streaming.output_peak", self.streaming.output_peak),
            ("streaming.conversion_input_level", self.streaming.conversion_input_level),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be between 0 and 1, got {}", name, value));
            }
        }

        if !self.synthesis.is_allowed(self.synthesis.default_speaker) {
            return Err(anyhow::anyhow!(
                "Default speaker {} is not in the allowed speaker list",
                self.synthesis.default_speaker
            ));
        }

        Ok(())
    }
}

impl SynthesisConfig {
    /// Whether sessions may use `speaker`.
    pub fn is_allowed(&self, speaker: u32) -> bool {
        self.allowed_speakers.is_empty() || self.allowed_speakers.contains(&speaker)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ConversionConfig {
    /// Control parameters sent with every engine call.
    pub fn params(&self) -> ConversionParams {
        ConversionParams {
            pitch_shift: self.pitch_shift,
            pitch_method: self.pitch_method,
            index_path: self.index_path.clone().filter(|p| !p.is_empty()),
            index_rate: self.index_rate,
            protect: self.protect,
            filter_radius: self.filter_radius,
            rms_mix_rate: self.rms_mix_rate,
            resample_rate: self.resample_rate,
            precision: self.precision,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl StreamingConfig {
    pub fn conditioner_settings(&self) -> ConditionerSettings {
        ConditionerSettings {
            fade_ceiling_samples: self.fade_ceiling_samples,
            noise_gate: self.noise_gate,
            output_peak: self.output_peak,
        }
    }
}
