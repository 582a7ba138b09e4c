//! Loopback HTTP daemon endpoint.
//!
//! Accepts `POST /cli` envelopes `{argv, params?, cwd?}` and returns the
//! serialised `CoreResult`. The daemon binds to loopback and additionally
//! rejects any non-loopback peer; there is no authentication by design.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use axum::Json;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use mcpu_config::paths;
use mcpu_core::CoreExecutionOptions;

use crate::runtime::{HubOptions, HubRuntime, build_runtime};

const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub bind: String,
    /// 0 binds an ephemeral port; the chosen port lands in the port file.
    pub port: u16,
    pub config_path: Option<PathBuf>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 0,
            config_path: None,
        }
    }
}

pub(crate) struct DaemonState {
    runtime: HubRuntime,
    shutdown: CancellationToken,
    started_at: Instant,
    spill_root: PathBuf,
    next_request: AtomicU64,
}

impl DaemonState {
    pub(crate) fn new(runtime: HubRuntime, spill_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            spill_root,
            next_request: AtomicU64::new(1),
        })
    }

    /// Spill root for one request: the caller's cwd when given, otherwise a
    /// request-scoped directory under the daemon spill root.
    fn request_output_dir(&self, cwd: Option<&str>) -> PathBuf {
        match cwd {
            Some(cwd) => PathBuf::from(cwd),
            None => {
                let seq = self.next_request.fetch_add(1, Ordering::Relaxed);
                self.spill_root
                    .join(format!("req-{}-{seq}", std::process::id()))
            }
        }
    }
}

/// Envelope of `POST /cli`.
#[derive(Debug, Deserialize)]
pub(crate) struct CliEnvelope {
    argv: Vec<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default, rename = "stdinData")]
    stdin_data: Option<String>,
}

/// Run the daemon until ctrl-c or `POST /shutdown`; drains in-flight
/// requests, then closes every pool connection.
pub async fn run_daemon(options: DaemonOptions) -> Result<()> {
    let runtime = build_runtime(HubOptions {
        config_path: options.config_path.clone(),
        ..Default::default()
    })?;

    let runtime_dir = paths::runtime_dir();
    std::fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("failed to create runtime dir: {}", runtime_dir.display()))?;

    // The pid file lock makes the daemon a singleton per user.
    let pid_path = paths::pid_path();
    let pid_file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&pid_path)
        .with_context(|| format!("failed to open pid file: {}", pid_path.display()))?;
    let mut pid_lock = fd_lock::RwLock::new(pid_file);
    let mut pid_guard = match pid_lock.try_write() {
        Ok(guard) => guard,
        Err(_) => bail!(
            "mcpu daemon already running (pid file locked: {})",
            pid_path.display()
        ),
    };
    {
        use std::io::Write;
        pid_guard.set_len(0).context("failed to truncate pid file")?;
        writeln!(&mut *pid_guard, "{}", std::process::id())
            .context("failed to write pid file")?;
    }

    let bind_addr: SocketAddr = format!("{}:{}", options.bind, options.port)
        .parse()
        .with_context(|| format!("invalid bind address '{}:{}'", options.bind, options.port))?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind daemon endpoint at {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local daemon address")?;

    let port_path = paths::port_path();
    std::fs::write(&port_path, format!("{}\n", local_addr.port()))
        .with_context(|| format!("failed to write port file: {}", port_path.display()))?;

    let spill_root = runtime_dir.join("spill");
    std::fs::create_dir_all(&spill_root)
        .with_context(|| format!("failed to create spill root: {}", spill_root.display()))?;

    let state = DaemonState::new(runtime, spill_root);
    let shutdown = state.shutdown.clone();

    let app = axum::Router::new()
        .route("/cli", post(handle_cli))
        .route("/healthz", get(handle_health))
        .route("/shutdown", post(handle_shutdown))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state.clone());

    tracing::info!(addr = %local_addr, "mcpu daemon listening");
    println!("mcpu daemon listening on http://{local_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c received, shutting down");
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested");
            }
        }
    })
    .await
    .context("daemon HTTP server failed")?;

    state.runtime.pool.shutdown_all().await;
    if let Err(error) = std::fs::remove_file(&port_path) {
        tracing::debug!(error = %error, "failed to remove port file");
    }
    Ok(())
}

fn forbidden(peer: SocketAddr) -> Response {
    tracing::warn!(peer = %peer, "rejecting non-loopback peer");
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "loopback connections only" })),
    )
        .into_response()
}

pub(crate) async fn handle_cli(
    State(state): State<Arc<DaemonState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(envelope): Json<CliEnvelope>,
) -> Response {
    if !peer.ip().is_loopback() {
        return forbidden(peer);
    }

    let output_dir = state.request_output_dir(envelope.cwd.as_deref());
    let opts = CoreExecutionOptions {
        argv: envelope.argv,
        params: envelope.params,
        cwd: envelope.cwd.map(PathBuf::from),
        stdin_data: envelope.stdin_data,
        output_dir: Some(output_dir),
    };
    let result = state.runtime.router.execute(opts).await;
    Json(result).into_response()
}

pub(crate) async fn handle_health(
    State(state): State<Arc<DaemonState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !peer.ip().is_loopback() {
        return forbidden(peer);
    }

    let servers: Vec<_> = state
        .runtime
        .pool
        .states()
        .await
        .into_iter()
        .map(|(name, status)| json!({ "name": name, "state": status.state }))
        .collect();
    Json(json!({
        "running": true,
        "pid": std::process::id(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "servers": servers,
    }))
    .into_response()
}

pub(crate) async fn handle_shutdown(
    State(state): State<Arc<DaemonState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !peer.ip().is_loopback() {
        return forbidden(peer);
    }
    state.shutdown.cancel();
    Json(json!({ "stopping": true })).into_response()
}
