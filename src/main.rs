//! # Playlist Splitter - Main Application Entry Point
//!
//! HTTP and WebSocket server that turns a long recording (a "playlist" video
//! with several songs back to back) into one file per track. Clients queue
//! over a WebSocket; a bounded number of jobs run at once.
//!
//! ## Application Architecture:
//! - **queue**: connection registry and worker-slot admission
//! - **dispatcher**: drives one connection from registration to close
//! - **session**: one job, from source retrieval to a download link
//! - **audio**: PCM conversion and silence-based segmentation
//! - **pipeline**: the external capabilities a job uses (yt-dlp, ffmpeg, zip, storage)
//! - **websocket**: the actix actor that carries the job protocol
//! - **config / state / error / health / middleware / handlers**: the HTTP service around it

mod audio;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod protocol;
mod queue;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use crate::config::{AppConfig, DEFAULT_SIGNING_SECRET};
use state::AppState;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler; polled by [`wait_for_shutdown`].
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. `.env`, logging, configuration (fail fast on invalid config)
/// 2. Shared state: pipeline adapters, connection registry, worker pool, dispatcher
/// 3. Background sweeper for expired download objects
/// 4. HTTP server, until a signal arrives
///
/// ## Shutdown:
/// The server stops accepting connections while the dispatcher closes the
/// worker pool and sends every open job channel a 1001 close.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting playlist-splitter v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    debug!("Effective configuration:\n{}", toml::to_string_pretty(&config.redacted())?);
    if config.storage.signing_secret == DEFAULT_SIGNING_SECRET {
        warn!("storage.signing_secret is the built-in default; download links can be forged");
    }

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let allowed_origins = config.server.allowed_origins.clone();

    let ttl = Duration::from_secs(config.storage.url_ttl_secs);
    let sweeper = pipeline::storage::spawn_sweeper(
        PathBuf::from(&config.storage.root),
        Duration::from_secs(config.storage.sweep_interval_secs),
        ttl,
    );

    setup_signal_handlers();

    info!(
        max_connections = config.queue.max_connections,
        worker_slots = config.queue.worker_slots,
        "Starting HTTP server on {}",
        bind_addr
    );

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(build_cors(&allowed_origins))
            .wrap(Logger::default())
            .wrap(middleware::RequestTelemetry)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/hunnoi")
                    .route("/ping", web::get().to(handlers::ping))
                    .route("/validate", web::post().to(handlers::validate_source))
                    .route("/ws", web::get().to(websocket::job_websocket))
                    .route("/downloads/{key:.*}", web::get().to(handlers::download))
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            tokio::join!(server_handle.stop(true), app_state.dispatcher.shutdown());
        }
    }

    sweeper.abort();
    info!(jobs = ?app_state.dispatcher.stats(), "Server stopped gracefully");
    Ok(())
}

/// Logging goes through `tracing`; `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playlist_splitter=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// CORS for the browser client. `"*"` in `server.allowed_origins` opens the
/// API to any origin.
fn build_cors(allowed_origins: &[String]) -> Cors {
    let mut cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);
    for origin in allowed_origins {
        cors = if origin == "*" {
            cors.allow_any_origin()
        } else {
            cors.allowed_origin(origin)
        };
    }
    cors
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
