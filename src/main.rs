use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use axum::routing::{get, post};
use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api_stream;
mod config;
mod errors;
mod frame_buffer;
mod frame_poller;
mod handlers;
mod recorder;
mod streamer;
#[cfg(all(test, unix))]
mod test_support;
mod transcoder;
mod utils;
mod watcher;
mod websocket;

use config::Config;
use frame_buffer::FrameBuffer;
use streamer::RtspStreamer;

#[derive(Parser, Debug)]
#[command(name = "rtsp-camera-streamer", version, about = "Relay an RTSP camera to the browser and record it with ffmpeg")]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Start streaming as soon as the server is up
    #[arg(long)]
    autostart: bool,

    /// Check the configuration and ffmpeg, then exit
    #[arg(long)]
    check: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub frames: FrameBuffer,
    pub streamer: Arc<Mutex<Option<RtspStreamer>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let frames = FrameBuffer::new(config.streaming.channel_buffer_size);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            frames,
            streamer: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Tell long-lived viewer streams to finish.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once `begin_shutdown` has been called.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            // An error means the state itself is gone, which is a shutdown too.
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }

    /// Stop the current stream, if any, along with its recording.
    pub async fn stop_streamer(&self) {
        if let Some(mut streamer) = self.streamer.lock().await.take() {
            if let Err(e) = streamer.stop_streaming().await {
                error!("Failed to stop stream on shutdown: {}", e);
            }
        }
    }
}

pub fn build_router(state: AppState) -> axum::Router {
    let recordings_dir = state.config.recording.output_directory.clone();

    axum::Router::new()
        .route("/", get(handlers::index_handler))
        .route("/video_feed", get(handlers::video_feed_handler))
        .route("/snapshot", get(handlers::snapshot_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/start_stream", post(api_stream::start_stream))
        .route("/stop_stream", post(api_stream::stop_stream))
        .route("/start_recording", post(api_stream::start_recording))
        .route("/stop_recording", post(api_stream::stop_recording))
        .route("/status", get(api_stream::status))
        .route("/recordings", get(api_stream::list_recordings))
        .nest_service("/recordings/files", tower_http::services::ServeDir::new(recordings_dir))
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> tower_http::cors::CorsLayer {
    match origin {
        None | Some("*") => tower_http::cors::CorsLayer::permissive(),
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(origin_header) => tower_http::cors::CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                tower_http::cors::CorsLayer::permissive()
            }
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rtsp_camera_streamer=debug,info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        warn!("Could not find {}, using default configuration", cli.config.display());
        Config::default()
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.autostart {
        config.streaming.autostart = true;
    }
    config.validate()?;

    let warnings = config.warnings();
    for warning in &warnings {
        warn!("{}", warning);
    }
    let ffmpeg_version = transcoder::probe_binary(&config.ffmpeg.binary).await;
    match &ffmpeg_version {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("ffmpeg check failed: {}", e),
    }

    if cli.check {
        let camera_url = config.camera.rtsp_url()?;
        info!("Camera URL: {}", utils::redact_url(&camera_url));
        ffmpeg_version?;
        info!("Configuration OK ({} warnings)", warnings.len());
        return Ok(());
    }

    for dir in [&config.recording.output_directory, &config.streaming.frame_directory] {
        std::fs::create_dir_all(dir)?;
        info!("Directory '{}' ready", dir.display());
    }

    let config = Arc::new(config);
    info!("RTSP URL: {}", utils::redact_url(&config.camera.rtsp_url()?));

    let state = AppState::new(config.clone());
    if config.streaming.autostart {
        let state = state.clone();
        tokio::spawn(async move {
            let mut current = state.streamer.lock().await;
            let started = match RtspStreamer::new(state.config.clone(), state.frames.clone()) {
                Ok(mut streamer) => streamer.start_streaming().await.map(|_| streamer),
                Err(e) => Err(e),
            };
            match started {
                Ok(streamer) => *current = Some(streamer),
                Err(e) => error!("Autostart failed: {}", e),
            }
        });
    }

    let app = build_router(state.clone())
        .layer(cors_layer(config.server.cors_allow_origin.as_deref()));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = shutdown_on(state.clone(), ctrl_c());
    match config.server.tls.as_ref().filter(|tls| tls.enabled) {
        Some(tls_config) => start_https_server(app, &addr, tls_config, shutdown).await?,
        None => start_http_server(app, &addr, shutdown).await?,
    }

    // No-op unless the server stopped for another reason.
    state.stop_streamer().await;
    info!("Server stopped");
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Wait for `signal`, then end viewer streams and stop the streamer before
/// the server starts draining connections.
async fn shutdown_on(state: AppState, signal: impl Future<Output = ()>) {
    signal.await;
    info!("Shutting down...");
    state.begin_shutdown();
    state.stop_streamer().await;
}

async fn start_http_server(
    app: axum::Router,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn load_rustls_config(tls_cfg: &config::TlsConfig) -> Result<rustls::ServerConfig> {
    let cert_file = File::open(&tls_cfg.cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", tls_cfg.cert_path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {}", e))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let open_key = || {
        File::open(&tls_cfg.key_path)
            .map(BufReader::new)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", tls_cfg.key_path, e))
    };
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open_key()?)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open_key()?)
            .map_err(|e| anyhow::anyhow!("Failed to parse RSA private key: {}", e))?;
    }
    let private_key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No private key found in key file"))?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(private_key))
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))
}

async fn start_https_server(
    app: axum::Router,
    addr: &str,
    tls_cfg: &config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let rustls_config = load_rustls_config(tls_cfg)?;
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!("HTTPS server listening on https://{} (certificate: {})", addr, tls_cfg.cert_path);
    axum_server::bind_rustls(addr.parse()?, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;

    Ok(())
}
