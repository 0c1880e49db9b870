//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice session.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many handlers and session tasks share ownership of the same data
//! - **Cloning**: `AppState` is `Clone`; every clone points at the same inner values
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers or one writer; used for metrics that every request updates
//! - **Poisoning**: A panic while holding the lock poisons it; we recover the inner
//!   value with `PoisonError::into_inner` rather than cascade the panic
//!
//! ## What lives here:
//! - **config**: Effective configuration, immutable after startup
//! - **metrics**: Request and streaming counters
//! - **sessions**: Registry of live WebSocket sessions
//! - **pipeline**: The shared voice pipeline, absent when the engine was unusable at startup

use crate::config::AppConfig;
use crate::session::{SessionRegistry, VoicePipeline};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration, fixed at startup
    pub config: Arc<AppConfig>,

    /// Performance metrics, updated by middleware and sessions
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live WebSocket sessions
    pub sessions: SessionRegistry,

    /// Synthesis + conversion pipeline shared by all sessions
    pub pipeline: Option<Arc<VoicePipeline>>,

    /// Why `pipeline` is absent
    pub engine_error: Option<String>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and voice sessions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors since server start
    pub error_count: u64,

    /// Sessions admitted since server start
    pub sessions_started: u64,

    /// Sessions that ended on an engine or internal failure
    pub sessions_failed: u64,

    /// Segments synthesized, converted and streamed
    pub segments_rendered: u64,

    /// Segments dropped after a transient failure
    pub segments_dropped: u64,

    /// PCM frames handed to peers
    pub frames_sent: u64,

    /// Bucket warm calls made on the request path
    pub warm_calls: u64,

    /// Engine outputs whose length was off by more than the tolerance
    pub length_mismatches: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one API endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// ## Parameters:
    /// - `config`: validated configuration
    /// - `pipeline`: the voice pipeline, or the reason it could not be built
    pub fn new(config: AppConfig, pipeline: Result<Arc<VoicePipeline>, String>) -> Self {
        let sessions = SessionRegistry::new(config.performance.max_concurrent_sessions);
        let (pipeline, engine_error) = match pipeline {
            Ok(pipeline) => (Some(pipeline), None),
            Err(reason) => (None, Some(reason)),
        };

        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions,
            pipeline,
            engine_error,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against an endpoint ("GET /health", "POST /tts", ...).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_started(&self) {
        self.metrics_mut().sessions_started += 1;
    }

    pub fn record_session_failed(&self) {
        self.metrics_mut().sessions_failed += 1;
    }

    /// Record one successfully streamed segment.
    pub fn record_segment_rendered(&self, frames: u64, warmed: bool, length_mismatch: bool) {
        let mut metrics = self.metrics_mut();
        metrics.segments_rendered += 1;
        metrics.frames_sent += frames;
        if warmed {
            metrics.warm_calls += 1;
        }
        if length_mismatch {
            metrics.length_mismatches += 1;
        }
    }

    pub fn record_segment_dropped(&self) {
        self.metrics_mut().segments_dropped += 1;
    }

    /// Snapshot of current metrics (lock released before serialization).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
