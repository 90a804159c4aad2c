use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use b2b_group_core::policy::ReverifyPolicy;
use b2b_group_storage::Database;
use b2b_group_util::AssignmentSettings;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::AdminAuth;
use crate::engine::{AssignmentEngine, Clock};
use crate::reverify::LoginReverifier;
use crate::{admin, hooks, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    hook_secret: Arc<[u8]>,
    clock: Clock,
    settings: Arc<AssignmentSettings>,
    engine: AssignmentEngine,
    reverifier: LoginReverifier,
    admin_auth: AdminAuth,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        hook_secret: Arc<[u8]>,
        admin_token_secret: &[u8],
        settings: AssignmentSettings,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let (engine, reverifier) = build_assignment(&storage, clock.clone(), &settings);
        Self {
            metrics,
            storage,
            hook_secret,
            clock,
            settings: Arc::new(settings),
            engine,
            reverifier,
            admin_auth: AdminAuth::new(admin_token_secret),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        let (engine, reverifier) = build_assignment(&self.storage, clock.clone(), &self.settings);
        self.clock = clock;
        self.engine = engine;
        self.reverifier = reverifier;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn hook_secret(&self) -> &[u8] {
        &self.hook_secret
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn engine(&self) -> &AssignmentEngine {
        &self.engine
    }

    pub fn reverifier(&self) -> &LoginReverifier {
        &self.reverifier
    }

    pub fn settings(&self) -> &AssignmentSettings {
        &self.settings
    }

    pub fn admin_auth(&self) -> &AdminAuth {
        &self.admin_auth
    }
}

fn build_assignment(
    storage: &Database,
    clock: Clock,
    settings: &AssignmentSettings,
) -> (AssignmentEngine, LoginReverifier) {
    let engine = AssignmentEngine::new(
        storage.clone(),
        clock,
        &settings.group_field,
        settings.log_capacity,
    );
    let policy = ReverifyPolicy::from_days(settings.reverify_window_days);
    let reverifier = LoginReverifier::new(engine.clone(), policy);
    (engine, reverifier)
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/hooks/lifecycle", post(hooks::handle))
        .route("/admin/overview", get(admin::overview))
        .route("/admin/nonces/:action", get(admin::issue_nonce))
        .route(
            "/admin/mappings",
            get(admin::list_mappings).post(admin::add_mapping),
        )
        .route("/admin/mappings/:domain", axum::routing::delete(admin::delete_mapping))
        .route("/admin/logs", get(admin::list_logs).delete(admin::clear_logs))
        .route("/admin/groups", get(admin::list_groups))
        .route("/admin/users/:id/reassign", post(admin::reassign_user))
        .route("/admin/users/:id/assignment", get(admin::user_assignment))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
pub const HOOK_SECRET: &[u8] = b"hook-secret";
