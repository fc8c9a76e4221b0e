pub mod auth;
pub mod error;
mod handlers;
mod pages;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::collab::{Collaborators, NotificationEffects};
use crate::exit_gate::ExitGate;
use crate::message_log::MessageLog;
use crate::server::StatusHandle;
use crate::sweep::{SweepJob, DEFAULT_INTERVAL};
use crate::token::TokenStore;

use handlers::*;
use session::SessionStore;

/// Defaults applied to `/api/message` requests that omit a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationDefaults {
    pub duration: Duration,
    pub effects: NotificationEffects,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            effects: NotificationEffects::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenStore>,
    pub sessions: Arc<SessionStore>,
    pub exit_gate: Arc<ExitGate>,
    pub sweep: SweepJob,
    pub collaborators: Collaborators,
    pub message_log: Arc<MessageLog>,
    pub server: StatusHandle,
    pub notification: NotificationDefaults,
}

impl AppState {
    pub fn new(tokens: Arc<TokenStore>, collaborators: Collaborators, server: StatusHandle) -> Self {
        Self {
            tokens,
            sessions: Arc::new(SessionStore::new()),
            exit_gate: Arc::new(ExitGate::new()),
            sweep: SweepJob::new(collaborators.clone(), DEFAULT_INTERVAL),
            collaborators,
            message_log: Arc::new(MessageLog::disabled()),
            server,
            notification: NotificationDefaults::default(),
        }
    }

    pub fn with_message_log(mut self, log: MessageLog) -> Self {
        self.message_log = Arc::new(log);
        self
    }

    pub fn with_notification_defaults(mut self, defaults: NotificationDefaults) -> Self {
        self.notification = defaults;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep = SweepJob::new(self.collaborators.clone(), interval);
        self
    }
}

/// Router options that are not part of the shared state.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Burst of login/setup attempts allowed per peer IP, refilled at one
    /// per second. `None` disables limiting.
    pub rate_limit: Option<u32>,
}

/// `OPTIONS` answers 200 with no body on every path.
async fn preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(req).await
}

fn panic_response(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("request handler panicked");
    error::ApiError::InternalError("request handler failed".into()).into_response()
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let read_routes = Router::new()
        .route("/api/status", get(server_status))
        .route("/api/schedule", get(schedule))
        .route("/api/windows", get(list_windows))
        .route("/api/close-windows", get(list_closeable_windows))
        .route("/api/screenshot", get(screenshot))
        .route("/api/exit-token/status", get(exit_token_status))
        .route("/api/auto-close/status", get(sweep_status))
        .route("/api/auto-close/logs", get(sweep_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let mutating_routes = Router::new()
        .route("/api/message", post(send_message))
        .route("/api/close-window", post(close_window))
        .route("/api/exit-token/set", post(exit_token_set))
        .route("/api/exit-token/clear", post(exit_token_clear))
        .route("/api/auto-close/start", post(sweep_start))
        .route("/api/auto-close/stop", post(sweep_stop))
        .route("/api/token/rotate", post(rotate_token))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session_or_token,
        ));

    let credential_routes = Router::new()
        .route("/api/login", post(login))
        .route("/api/setup", post(setup));

    // Brute-force protection for the short human-typable token.
    let credential_routes = match config.rate_limit.filter(|burst| *burst > 0) {
        Some(burst) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            match GovernorConfigBuilder::default()
                .per_second(1)
                .burst_size(burst)
                .key_extractor(PeerIpKeyExtractor)
                .finish()
            {
                Some(conf) => credential_routes.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(burst, "invalid login rate limit, limiting disabled");
                    credential_routes
                }
            }
        }
        None => credential_routes,
    };

    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/login", get(login_page))
        .route("/setup", get(setup_page))
        .route("/assets/{file}", get(asset))
        .route("/health", get(health))
        .route("/api/logout", post(logout))
        .merge(read_routes)
        .merge(mutating_routes)
        .merge(credential_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(preflight))
        .layer(DefaultBodyLimit::max(auth::MAX_BODY_BYTES))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(
                "default-src 'self'; script-src 'self'; style-src 'self'; \
                 connect-src 'self'; img-src 'self' data: blob:; frame-ancestors 'none'",
            ),
        ))
}
