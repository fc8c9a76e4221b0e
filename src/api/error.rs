use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::collab::CollaboratorError;
use crate::sweep::SweepError;
use crate::token::TokenError;

/// Structured error type for all API handlers.
///
/// Every variant maps to an HTTP status code, a machine-readable code string
/// and a human-readable message. The body always carries `success: false` so
/// browser clients can branch on one field.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No session and no inline token.
    AuthRequired,
    /// 401 - A token was supplied but did not match.
    AuthInvalid,
    /// 404
    NotFound,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Setup while configured, sweep armed twice, and similar.
    ConfigurationConflict(String),
    /// 503 - A collaborator is not installed.
    CollaboratorUnavailable(String),
    /// 500 - A collaborator ran and failed.
    CollaboratorFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) | ApiError::ConfigurationConflict(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::CollaboratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::CollaboratorFailed(_) | ApiError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::NotFound => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::ConfigurationConflict(_) => "configuration_conflict",
            ApiError::CollaboratorUnavailable(_) => "collaborator_unavailable",
            ApiError::CollaboratorFailed(_) => "collaborator_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Log in or include the access token.".to_string()
            }
            ApiError::AuthInvalid => "Invalid access token.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::ConfigurationConflict(detail) => detail.clone(),
            ApiError::CollaboratorUnavailable(detail) => {
                format!("Service unavailable: {}.", detail)
            }
            ApiError::CollaboratorFailed(detail) => detail.clone(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.message(),
            "code": self.code(),
        });
        if matches!(self, ApiError::AuthRequired) {
            body["requireAuth"] = serde_json::Value::Bool(true);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<CollaboratorError> for ApiError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::Unavailable(_) => ApiError::CollaboratorUnavailable(e.to_string()),
            CollaboratorError::Failed(msg) => ApiError::CollaboratorFailed(msg),
        }
    }
}

impl From<SweepError> for ApiError {
    fn from(e: SweepError) -> Self {
        match e {
            SweepError::Collaborator(inner) => inner.into(),
            SweepError::EmptyKeyword => ApiError::InvalidRequest(e.to_string()),
            SweepError::AlreadyRunning(_) | SweepError::NotRunning => {
                ApiError::ConfigurationConflict(e.to_string())
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::AlreadyConfigured => ApiError::ConfigurationConflict(e.to_string()),
            TokenError::NotConfigured | TokenError::InvalidFormat => {
                ApiError::InvalidRequest(e.to_string())
            }
            TokenError::Mismatch => ApiError::AuthInvalid,
            TokenError::Io { .. } | TokenError::Corrupt(_) => {
                tracing::error!(error = %e, "token store failure");
                ApiError::InternalError(e.to_string())
            }
        }
    }
}
