//! Axum app: state and the `/api/v1` router.

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use kitt::Controller;

use crate::auth::CsrfTokens;
use crate::handlers::{agents, campaigns, events, quicktest, runs, system};

pub struct AppState {
    pub ctrl: Arc<Controller>,
    /// Admin bearer protecting write endpoints.
    pub admin_token: String,
    pub csrf: CsrfTokens,
    /// Agent distribution tarball served at `/agent/package`, if present.
    pub agent_package: Option<PathBuf>,
    /// Base URL baked into the install script.
    pub public_url: String,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(system::health))
        .route("/api/v1/csrf", get(system::issue_csrf))
        .route("/api/v1/agents", get(agents::list))
        .route("/api/v1/agents/register", post(agents::register))
        .route("/api/v1/agents/test", post(agents::create_test_agent))
        .route(
            "/api/v1/agents/:id",
            get(agents::get_one).delete(agents::remove),
        )
        .route("/api/v1/agents/:id/heartbeat", post(agents::heartbeat))
        .route("/api/v1/agents/:id/rotate-token", post(agents::rotate_token))
        .route(
            "/api/v1/agents/:id/settings",
            get(agents::get_settings).put(agents::put_settings),
        )
        .route("/api/v1/quicktest", post(quicktest::dispatch).get(quicktest::list))
        .route(
            "/api/v1/quicktest/agent-capabilities",
            post(quicktest::agent_capabilities),
        )
        .route("/api/v1/quicktest/:id", get(quicktest::get_one))
        .route(
            "/api/v1/quicktest/:id/logs",
            post(quicktest::push_logs).get(quicktest::get_logs),
        )
        .route("/api/v1/quicktest/:id/status", post(quicktest::post_status))
        .route("/api/v1/quicktest/:id/cancel", post(quicktest::cancel))
        .route(
            "/api/v1/campaigns",
            post(campaigns::create).get(campaigns::list),
        )
        .route(
            "/api/v1/campaigns/:id",
            get(campaigns::get_one).put(campaigns::update),
        )
        .route("/api/v1/campaigns/:id/launch", post(campaigns::launch))
        .route("/api/v1/campaigns/:id/cancel", post(campaigns::cancel))
        .route("/api/v1/campaigns/:id/logs", get(campaigns::logs))
        .route("/api/v1/runs", get(runs::query))
        .route("/api/v1/runs/:id", get(runs::get_one).delete(runs::remove))
        .route("/api/v1/runs/:id/export", get(runs::export))
        .route("/api/v1/results/aggregate", get(runs::aggregate))
        .route("/api/v1/events/stream", get(events::stream_all))
        .route("/api/v1/events/stream/:source", get(events::stream_source))
        .route(
            "/api/v1/store/karr",
            get(system::karr_gone).post(system::karr_gone),
        )
        .route("/agent/install.sh", get(system::install_script))
        .route("/agent/package", get(system::agent_package))
        .with_state(state)
}
