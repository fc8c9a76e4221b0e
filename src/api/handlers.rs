use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::collab::{ClassPeriod, CollaboratorError, Notification, WindowInfo};
use crate::message_log::MessageLogEntry;
use crate::token::TokenStore;

use super::auth::{has_session, session_cookie};
use super::error::ApiError;
use super::pages::page;
use super::session::SESSION_COOKIE;
use super::AppState;

const MAX_DURATION_SECS: u64 = 3600;

/// Peer address of the connection, or "unknown" when served without one.
pub(super) struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

impl PeerAddr {
    fn ip_string(&self) -> String {
        self.0
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Parse a JSON body; an empty body reads as `{}`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    let slice: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(slice).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

/// Run a synchronous collaborator call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CollaboratorError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "collaborator call panicked");
            ApiError::InternalError("collaborator call failed".into())
        })?
        .map_err(ApiError::from)
}

fn session_cookie_header(id: &str, max_age: Duration) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={id}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        max_age.as_secs()
    ))
    .map_err(|e| ApiError::InternalError(e.to_string()))
}

fn with_new_session(state: &AppState, body: serde_json::Value) -> Result<Response, ApiError> {
    let id = state.sessions.create();
    let cookie = session_cookie_header(&id, state.sessions.ttl())?;
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

// ── Pages ──────────────────────────────────────────────────────────

pub(super) async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.tokens.is_configured() {
        return Redirect::temporary("/setup").into_response();
    }
    if !has_session(&state, &headers) {
        return Redirect::temporary("/login").into_response();
    }
    page("index.html")
}

pub(super) async fn login_page(State(state): State<AppState>) -> Response {
    if !state.tokens.is_configured() {
        return Redirect::temporary("/setup").into_response();
    }
    page("login.html")
}

pub(super) async fn setup_page(State(state): State<AppState>) -> Response {
    if state.tokens.is_configured() {
        return Redirect::temporary("/login").into_response();
    }
    page("setup.html")
}

pub(super) async fn asset(axum::extract::Path(file): axum::extract::Path<String>) -> Response {
    match file.as_str() {
        "app.js" | "style.css" => page(&file),
        _ => ApiError::NotFound.into_response(),
    }
}

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ── Setup, login, token rotation ───────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TokenBody {
    token: Option<String>,
}

pub(super) async fn setup(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    body: Bytes,
) -> Result<Response, ApiError> {
    if state.tokens.is_configured() {
        return Err(ApiError::ConfigurationConflict(
            "An access token is already configured.".into(),
        ));
    }
    let req: TokenBody = parse_body(&body)?;
    let token = match req.token.map(|t| t.trim().to_string()) {
        Some(t) if !t.is_empty() => t,
        _ => TokenStore::generate(),
    };
    state.tokens.set_token(&token)?;
    tracing::info!(?peer, "access token configured through setup");
    with_new_session(
        &state,
        serde_json::json!({ "success": true, "token": token }),
    )
}

pub(super) async fn login(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !state.tokens.is_configured() {
        return Err(ApiError::InvalidRequest(
            "no access token is configured; complete setup first".into(),
        ));
    }
    let req: TokenBody = parse_body(&body)?;
    let token = req
        .token
        .ok_or_else(|| ApiError::InvalidRequest("missing token".into()))?;
    if !state.tokens.validate(token.trim()) {
        tracing::warn!(?peer, "failed login attempt");
        return Err(ApiError::AuthInvalid);
    }
    tracing::info!(?peer, "login succeeded");
    with_new_session(&state, serde_json::json!({ "success": true }))
}

pub(super) async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(id) = session_cookie(&headers) {
        state.sessions.revoke(id);
    }
    let clear = HeaderValue::from_static("session=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
    (
        [(header::SET_COOKIE, clear)],
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotateBody {
    current_token: String,
    new_token: Option<String>,
}

pub(super) async fn rotate_token(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: RotateBody = parse_body(&body)?;
    let new_token = match req.new_token.map(|t| t.trim().to_string()) {
        Some(t) if !t.is_empty() => t,
        _ => TokenStore::generate(),
    };
    state.tokens.rotate(req.current_token.trim(), &new_token)?;
    state.sessions.clear();
    tracing::info!("access token rotated");
    with_new_session(
        &state,
        serde_json::json!({ "success": true, "token": new_token }),
    )
}

// ── Status ─────────────────────────────────────────────────────────

pub(super) async fn server_status(State(state): State<AppState>) -> Response {
    let status = state.server.snapshot();
    let mut body = serde_json::to_value(&status).unwrap_or_default();
    body["success"] = serde_json::Value::Bool(true);
    Json(body).into_response()
}

// ── Notifications ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct MessageBody {
    message: Option<String>,
    speech: Option<bool>,
    duration: Option<u64>,
    sound: Option<bool>,
    emphasis: Option<bool>,
    topmost: Option<bool>,
}

pub(super) async fn send_message(
    State(state): State<AppState>,
    peer: PeerAddr,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: MessageBody = parse_body(&body)?;
    let message = req
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("message must not be empty".into()))?;
    let duration_secs = req
        .duration
        .unwrap_or_else(|| state.notification.duration.as_secs());
    if !(1..=MAX_DURATION_SECS).contains(&duration_secs) {
        return Err(ApiError::InvalidRequest(format!(
            "duration must be between 1 and {MAX_DURATION_SECS} seconds"
        )));
    }

    let defaults = state.notification.effects;
    let mut effects = defaults;
    effects.sound = req.sound.unwrap_or(defaults.sound);
    effects.emphasis = req.emphasis.unwrap_or(defaults.emphasis);
    effects.topmost = req.topmost.unwrap_or(defaults.topmost);
    let notification = Notification {
        message: message.clone(),
        duration: Duration::from_secs(duration_secs),
        speech: req.speech.unwrap_or(false),
        effects,
    };

    let result = match state.collaborators.notifier() {
        Ok(notifier) => blocking(move || notifier.show_notification(&notification)).await,
        Err(e) => Err(e.into()),
    };

    let now = Local::now();
    let entry = MessageLogEntry::new(now, &message, result.is_ok(), &peer.ip_string());
    if let Err(e) = state.message_log.append(now, &entry).await {
        tracing::warn!(error = %e, "failed to write message log");
    }

    result?;
    tracing::info!(source = %peer.ip_string(), duration_secs, "message delivered");
    Ok(Json(serde_json::json!({ "success": true })))
}

// ── Schedule ───────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassView {
    start_time: String,
    end_time: String,
    subject: String,
    is_current: bool,
}

impl ClassView {
    fn new(period: &ClassPeriod, now: chrono::NaiveTime) -> Self {
        Self {
            start_time: period.start.format("%H:%M").to_string(),
            end_time: period.end.format("%H:%M").to_string(),
            subject: period.subject.clone(),
            is_current: period.contains(now),
        }
    }
}

pub(super) async fn schedule(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provider = state.collaborators.schedule()?;
    let (plan, upcoming, now) = blocking(move || {
        Ok((
            provider.current_plan()?,
            provider.upcoming_period()?,
            provider.now(),
        ))
    })
    .await?;

    let classes: Vec<ClassView> = plan.iter().map(|p| ClassView::new(p, now)).collect();
    let upcoming = upcoming.map(|p| ClassView::new(&p, now));
    Ok(Json(serde_json::json!({
        "success": true,
        "classes": classes,
        "upcoming": upcoming,
    })))
}

// ── Windows ────────────────────────────────────────────────────────

pub(super) async fn list_windows(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let screen = state.collaborators.screen()?;
    let windows = blocking(move || screen.list_windows()).await?;
    Ok(Json(serde_json::json!({ "success": true, "data": windows })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseableWindowView {
    #[serde(flatten)]
    window: WindowInfo,
    is_closeable: bool,
    is_current_process: bool,
    closeable_reason: &'static str,
}

fn closeable_reason(window: &WindowInfo) -> &'static str {
    if window.is_current_process() {
        "belongs to the control server process"
    } else if window.system_critical {
        "system-critical window"
    } else {
        "closeable"
    }
}

pub(super) async fn list_closeable_windows(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let screen = state.collaborators.screen()?;
    let windows = blocking(move || screen.list_windows()).await?;
    let data: Vec<CloseableWindowView> = windows
        .into_iter()
        .map(|w| CloseableWindowView {
            is_closeable: w.is_closeable(),
            is_current_process: w.is_current_process(),
            closeable_reason: closeable_reason(&w),
            window: w,
        })
        .collect();
    Ok(Json(serde_json::json!({ "success": true, "data": data })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseWindowBody {
    window_handle: Option<serde_json::Value>,
    #[serde(default)]
    force_close: bool,
}

/// Window handles arrive as numbers or numeric strings.
fn parse_handle(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(super) async fn close_window(
    State(state): State<AppState>,
    peer: PeerAddr,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: CloseWindowBody = parse_body(&body)?;
    let handle = req
        .window_handle
        .as_ref()
        .and_then(parse_handle)
        .ok_or_else(|| ApiError::InvalidRequest("windowHandle is required".into()))?;

    let screen = state.collaborators.screen()?;
    let closer = state.collaborators.closer()?;
    let windows = blocking(move || screen.list_windows()).await?;
    let target = windows
        .into_iter()
        .find(|w| w.handle == handle)
        .ok_or_else(|| ApiError::InvalidRequest(format!("no window with handle {handle}")))?;
    if !target.is_closeable() {
        return Err(ApiError::InvalidRequest(format!(
            "refusing to close '{}': {}",
            target.title,
            closeable_reason(&target)
        )));
    }

    let force = req.force_close;
    let outcome = blocking(move || closer.close_window(handle, force)).await?;
    tracing::info!(
        source = %peer.ip_string(),
        handle,
        force,
        ok = outcome.ok,
        title = %outcome.title,
        "close-window request"
    );
    if !outcome.ok {
        return Err(ApiError::CollaboratorFailed(format!(
            "could not close '{}' via {}",
            target.title, outcome.method
        )));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "windowTitle": outcome.title,
        "processName": outcome.process_name,
        "method": outcome.method,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ScreenshotQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    window_handle: Option<String>,
}

pub(super) async fn screenshot(
    State(state): State<AppState>,
    Query(query): Query<ScreenshotQuery>,
) -> Result<Response, ApiError> {
    let screen = state.collaborators.screen()?;
    let shot = match query.kind.as_deref().unwrap_or("fullscreen") {
        "fullscreen" => blocking(move || screen.capture_screen()).await?,
        "window" => {
            let handle = query
                .window_handle
                .as_deref()
                .and_then(|h| h.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    ApiError::InvalidRequest("windowHandle is required for window capture".into())
                })?;
            blocking(move || screen.capture_window(handle)).await?
        }
        other => {
            return Err(ApiError::InvalidRequest(format!(
                "unknown screenshot type '{other}', expected fullscreen or window"
            )))
        }
    };

    let filename = format!(
        "screenshot_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        shot.extension
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, shot.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{filename}\""),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        shot.bytes,
    )
        .into_response())
}

// ── Exit gate ──────────────────────────────────────────────────────

pub(super) async fn exit_token_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = serde_json::to_value(state.exit_gate.status()).unwrap_or_default();
    body["success"] = serde_json::Value::Bool(true);
    Json(body)
}

pub(super) async fn exit_token_set(State(state): State<AppState>) -> Json<serde_json::Value> {
    let token = state.exit_gate.set();
    Json(serde_json::json!({ "success": true, "token": token }))
}

pub(super) async fn exit_token_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.exit_gate.clear();
    Json(serde_json::json!({ "success": true }))
}

// ── Auto-close monitor ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweepStartBody {
    keyword: Option<String>,
    #[serde(default)]
    force_close: bool,
}

pub(super) async fn sweep_start(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: SweepStartBody = parse_body(&body)?;
    let keyword = req.keyword.unwrap_or_default();
    state.sweep.arm(&keyword, req.force_close)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("auto-close monitor started for '{}'", keyword.trim()),
    })))
}

pub(super) async fn sweep_stop(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sweep.disarm()?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub(super) async fn sweep_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = serde_json::to_value(state.sweep.status()).unwrap_or_default();
    body["success"] = serde_json::Value::Bool(true);
    Json(body)
}

pub(super) async fn sweep_logs(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "logs": state.sweep.recent_log() }))
}

// ── Fallback ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct Endpoint {
    method: &'static str,
    path: &'static str,
    auth: &'static str,
    description: &'static str,
}

const fn ep(
    method: &'static str,
    path: &'static str,
    auth: &'static str,
    description: &'static str,
) -> Endpoint {
    Endpoint {
        method,
        path,
        auth,
        description,
    }
}

const ENDPOINTS: &[Endpoint] = &[
    ep("GET", "/", "session", "control page"),
    ep("GET", "/login", "none", "login page"),
    ep("GET", "/setup", "none", "first-run setup page"),
    ep("GET", "/health", "none", "liveness probe"),
    ep("POST", "/api/setup", "none", "set the access token once {token?}"),
    ep("POST", "/api/login", "none", "log in {token}"),
    ep("POST", "/api/logout", "none", "end the current session"),
    ep("POST", "/api/token/rotate", "session or token", "replace the access token {currentToken, newToken?}"),
    ep("GET", "/api/status", "session", "server state and reachable URLs"),
    ep("POST", "/api/message", "session or token", "show a notification {message, speech?, duration?}"),
    ep("GET", "/api/schedule", "session", "today's timetable"),
    ep("GET", "/api/windows", "session", "list top-level windows"),
    ep("GET", "/api/close-windows", "session", "list windows with closeability"),
    ep("POST", "/api/close-window", "session or token", "close a window {windowHandle, forceClose?}"),
    ep("GET", "/api/screenshot", "session", "capture ?type=fullscreen|window&windowHandle="),
    ep("GET", "/api/exit-token/status", "session", "exit gate state"),
    ep("POST", "/api/exit-token/set", "session or token", "arm the exit gate"),
    ep("POST", "/api/exit-token/clear", "session or token", "disarm the exit gate"),
    ep("POST", "/api/auto-close/start", "session or token", "arm the auto-close monitor {keyword, forceClose?}"),
    ep("POST", "/api/auto-close/stop", "session or token", "disarm the auto-close monitor"),
    ep("GET", "/api/auto-close/status", "session", "auto-close monitor state"),
    ep("GET", "/api/auto-close/logs", "session", "recent auto-close log lines"),
];

pub(super) async fn not_found(method: Method, uri: Uri) -> Response {
    tracing::debug!(%method, path = %uri.path(), "unmatched route");
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": format!("No route for {} {}.", method, uri.path()),
            "code": "not_found",
            "endpoints": ENDPOINTS,
        })),
    )
        .into_response()
}
