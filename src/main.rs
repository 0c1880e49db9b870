//! # Voice Relay - Main Application Entry Point
//!
//! A streaming text-to-speech relay: text arrives over a WebSocket in chunks,
//! is cut into speakable segments, synthesized by a VOICEVOX engine, converted
//! to a target voice by a remote RVC worker, conditioned, and streamed back as
//! fixed-duration PCM frames.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every session, handler and engine call is asynchronous
//! - **Trait objects**: Engines are reached through `Arc<dyn Synthesizer>` and
//!   `Arc<dyn VoiceConverter>`
//! - **Result<T, E>**: `anyhow` at startup, typed errors everywhere else
//! - **Arc & Mutex**: One conversion engine shared by every session
//!
//! ## Application Architecture:
//! - **config**: Defaults, `config.toml` and environment variables
//! - **segmenter**: Text chunks → speakable segments
//! - **engine**: Synthesis and conversion adapters, bucket scheduler
//! - **audio**: Codecs, conditioning, packetizing, signal quality
//! - **session**: Per-connection state machine and the rendering pipeline
//! - **websocket**: Actor glue between WebSocket frames and sessions
//! - **handlers / health**: HTTP endpoints
//! - **middleware**: Request logging and metrics

mod audio;       // PCM codecs, conditioning, framing (audio/ directory)
mod config;      // Configuration management (config.rs)
mod engine;      // External engine adapters (engine/ directory)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod segmenter;   // Streaming text segmentation (segmenter.rs)
mod session;     // Voice sessions (session/ directory)
mod state;       // Application state management (state.rs)
mod websocket;   // WebSocket session endpoints (websocket.rs)

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use audio::conditioner::AudioConditioner;
use config::AppConfig;
use engine::{BucketScheduler, ConversionEngine, HttpVoiceConverter, VoicevoxSynthesizer};
use error::StreamError;
use session::pipeline::PipelineSettings;
use session::VoicePipeline;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Connects the engines**: probes the conversion worker and pre-warms buckets
/// 4. **Configures the HTTP server** with middleware, REST and WebSocket routes
/// 5. **Handles graceful shutdown** on SIGINT / SIGTERM
///
/// ## Error Handling:
/// Configuration problems end the process. An unreachable conversion worker
/// ends it too when `conversion.required` is set; otherwise the server starts
/// degraded and reports the reason on every session and on `/health`.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let pipeline = build_pipeline(&config).await?;
    let app_state = AppState::new(config.clone(), pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/tts", web::post().to(handlers::synthesize))
            .route("/ws/tts_stream", web::get().to(websocket::tts_stream_socket))
            .route("/ws/tts", web::get().to(websocket::tts_socket))
            .route("/ws/rvc", web::get().to(websocket::conversion_socket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Connect both engines and assemble the shared pipeline.
///
/// ## Returns:
/// - **Ok(Ok(pipeline))**: Ready to serve
/// - **Ok(Err(reason))**: Conversion worker unreachable but not required; start degraded
/// - **Err(_)**: Startup must abort
async fn build_pipeline(config: &AppConfig) -> Result<Result<Arc<VoicePipeline>, String>> {
    let synthesizer = VoicevoxSynthesizer::new(
        config.synthesis.url.clone(),
        config.synthesis.sample_rate,
        config.synthesis.connect_timeout(),
        config.synthesis.timeout(),
    )?;
    synthesizer
        .initialize_speaker(config.synthesis.default_speaker)
        .await;

    let converter =
        HttpVoiceConverter::new(config.conversion.engine_url.clone(), config.conversion.timeout())?;

    if let Err(e) = converter.probe().await {
        let reason = format!(
            "conversion engine at {} is unusable: {}",
            config.conversion.engine_url, e
        );
        if config.conversion.required {
            return Err(StreamError::Configuration(reason).into());
        }
        warn!("{}; starting degraded", reason);
        return Ok(Err(reason));
    }
    info!("Conversion engine reachable at {}", config.conversion.engine_url);

    let scheduler = BucketScheduler::new(
        config.conversion.bucketing,
        config.conversion.bucket_size,
        config.conversion.internal_rate,
    );
    let engine = Arc::new(ConversionEngine::new(
        Arc::new(converter),
        config.conversion.params(),
        scheduler,
        config.conversion.internal_rate,
    ));
    engine.prewarm(&config.conversion.prewarm_lengths).await;

    let pipeline = VoicePipeline::new(
        Arc::new(synthesizer),
        engine,
        AudioConditioner::new(config.streaming.conditioner_settings()),
        PipelineSettings::from_config(config),
    );
    Ok(Ok(Arc::new(pipeline)))
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_relay=trace")
/// - If not set, defaults to "voice_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives.
///
/// If a handler cannot be installed the failure is logged and only the other
/// signal is awaited.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
