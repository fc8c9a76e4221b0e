use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;
use super::session::SESSION_COOKIE;
use super::AppState;

/// Largest body the inline-token check will buffer.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Extract the session id from the `Cookie` header(s).
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find_map(|(name, value)| (name == SESSION_COOKIE).then_some(value))
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// True if the request carries a live session cookie.
pub fn has_session(state: &AppState, headers: &HeaderMap) -> bool {
    session_cookie(headers).is_some_and(|id| state.sessions.validate(id))
}

/// Pull a string `token` field out of a JSON body.
fn inline_token(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("token")?.as_str().map(str::to_owned)
}

/// Decide whether a request may proceed.
///
/// Order: session cookie, then `Authorization: Bearer`, then (only when
/// `allow_inline` is set) a `token` field in the JSON body. The body is
/// buffered for the last step and handed back inside the returned request.
pub async fn authorize(
    state: &AppState,
    req: Request,
    allow_inline: bool,
) -> Result<Request, ApiError> {
    if has_session(state, req.headers()) {
        return Ok(req);
    }

    if let Some(token) = extract_bearer(req.headers()) {
        return if state.tokens.validate(token) {
            Ok(req)
        } else {
            Err(ApiError::AuthInvalid)
        };
    }

    if !allow_inline {
        return Err(ApiError::AuthRequired);
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::InvalidRequest("request body too large".into()))?;
    match inline_token(&bytes) {
        Some(token) if state.tokens.validate(&token) => {
            Ok(Request::from_parts(parts, Body::from(bytes)))
        }
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

/// Middleware for read routes: session cookie (or Bearer token).
pub async fn require_session(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let req = authorize(&state, req, false).await?;
    Ok(next.run(req).await)
}

/// Middleware for mutating routes: session cookie, Bearer token, or an
/// inline `token` field in the JSON body.
pub async fn require_session_or_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path().to_owned();
    let req = authorize(&state, req, true).await.inspect_err(|e| {
        tracing::debug!(%path, code = e.code(), "mutating request rejected");
    })?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn session_cookie_found_among_others() {
        let headers = headers_with_cookie("theme=dark; session=abc123; lang=en");
        assert_eq!(session_cookie(&headers), Some("abc123"));
    }

    #[test]
    fn session_cookie_missing() {
        let headers = headers_with_cookie("theme=dark");
        assert_eq!(session_cookie(&headers), None);
        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn similarly_named_cookie_is_ignored() {
        let headers = headers_with_cookie("old_session=zzz");
        assert_eq!(session_cookie(&headers), None);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(extract_bearer(&headers), Some("tok"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic tok"));
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn inline_token_requires_string_field() {
        assert_eq!(
            inline_token(br#"{"token":"ABC-123","message":"hi"}"#),
            Some("ABC-123".to_string())
        );
        assert_eq!(inline_token(br#"{"token":42}"#), None);
        assert_eq!(inline_token(b"not json"), None);
        assert_eq!(inline_token(b""), None);
    }

    mod with_state {
        use super::*;
        use crate::api::test_support::state_with_token;

        fn post(body: &str) -> Request {
            Request::builder()
                .method("POST")
                .uri("/api/x")
                .body(Body::from(body.to_string()))
                .unwrap()
        }

        #[tokio::test]
        async fn inline_token_accepted_and_body_preserved() {
            let (state, token) = state_with_token();
            let body = format!(r#"{{"token":"{token}","message":"hello"}}"#);
            let req = authorize(&state, post(&body), true).await.unwrap();
            let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
                .await
                .unwrap();
            assert_eq!(bytes, body.as_bytes());
        }

        #[tokio::test]
        async fn inline_token_ignored_for_read_routes() {
            let (state, token) = state_with_token();
            let body = format!(r#"{{"token":"{token}"}}"#);
            let err = authorize(&state, post(&body), false).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
            assert!(matches!(err, ApiError::AuthRequired));
        }

        #[tokio::test]
        async fn wrong_inline_token_is_invalid() {
            let (state, _) = state_with_token();
            let err = authorize(&state, post(r#"{"token":"nope"}"#), true)
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::AuthInvalid));
        }

        #[tokio::test]
        async fn session_cookie_accepted() {
            let (state, _) = state_with_token();
            let id = state.sessions.create();
            let req = Request::builder()
                .uri("/api/x")
                .header(header::COOKIE, format!("session={id}"))
                .body(Body::empty())
                .unwrap();
            assert!(authorize(&state, req, false).await.is_ok());
        }

        #[tokio::test]
        async fn bearer_token_accepted() {
            let (state, token) = state_with_token();
            let req = Request::builder()
                .uri("/api/x")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap();
            assert!(authorize(&state, req, false).await.is_ok());
        }
    }
}
