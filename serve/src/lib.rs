//! HTTP + SSE surface for the kitt controller (axum).
//!
//! Versioned REST endpoints under `/api/v1`, SSE streams at
//! `/api/v1/events/stream[/:source]`, and the agent distribution at
//! `/agent/install.sh` + `/agent/package`.
//!
//! **Public API**: [`ServeConfig`], [`run_serve`], [`run_serve_on_listener`].

mod app;
mod auth;
mod error;
mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use kitt::{Controller, KittError};

use app::{router, AppState};
use auth::CsrfTokens;

const DEFAULT_ADDR: &str = "127.0.0.1:9100";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    /// Admin bearer for write endpoints. Startup refuses without one.
    pub admin_token: String,
    /// Base URL advertised to agents (install script).
    pub public_url: Option<String>,
    /// Agent distribution tarball, when built.
    pub agent_package: Option<PathBuf>,
}

impl ServeConfig {
    /// Reads `KITT_AUTH_TOKEN` (required) and optional package settings from
    /// the environment.
    pub fn from_env() -> Result<Self, KittError> {
        let admin_token = std::env::var("KITT_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                KittError::Fatal("KITT_AUTH_TOKEN is required to start the controller".into())
            })?;
        Ok(Self {
            admin_token,
            public_url: std::env::var("KITT_PUBLIC_URL").ok(),
            agent_package: std::env::var("KITT_AGENT_PACKAGE").ok().map(PathBuf::from),
        })
    }
}

/// Serves on an existing listener. Tests bind `127.0.0.1:0` and pass the
/// listener in.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    ctrl: Arc<Controller>,
    config: ServeConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("controller listening on http://{}", addr);
    let state = Arc::new(AppState {
        ctrl,
        admin_token: config.admin_token,
        csrf: CsrfTokens::default(),
        agent_package: config.agent_package,
        public_url: config
            .public_url
            .unwrap_or_else(|| format!("http://{addr}")),
    });
    let app = router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Binds `addr` (default 127.0.0.1:9100) and serves until the process exits.
pub async fn run_serve(
    addr: Option<&str>,
    ctrl: Arc<Controller>,
    config: ServeConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, ctrl, config).await
}
