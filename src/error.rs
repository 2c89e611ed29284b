use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Every way a login attempt or an authenticated request can fail.
///
/// The gate decides what the user sees from the kind alone. Response bodies
/// never carry the detail string.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Network, DNS, timeout or malformed reply while talking to the provider.
    #[error("identity provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// The provider reported an error on the callback (e.g. consent refused).
    #[error("identity provider returned {error}")]
    ProviderDenied {
        error: String,
        description: Option<String>,
    },

    /// Unknown, expired or replayed state value. The user has to start over.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Signature, issuer, audience, nonce or claim validation failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Session cookie missing, tampered with, revoked or expired.
    #[error("session invalid")]
    SessionInvalid,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable name of the error kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::ProviderUnreachable(_) => "provider_unreachable",
            AuthError::ProviderDenied { .. } => "provider_denied",
            AuthError::InvalidState(_) => "invalid_state",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::RefreshFailed(_) => "refresh_failed",
            AuthError::SessionInvalid => "session_invalid",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Errors that should restart the login instead of showing an error page.
    pub fn requires_login(&self) -> bool {
        matches!(self, AuthError::RefreshFailed(_) | AuthError::SessionInvalid)
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AuthError::ProviderUnreachable(_) => {
                (StatusCode::BAD_GATEWAY, "Identity provider unavailable")
            }
            AuthError::ProviderDenied { .. } => (StatusCode::FORBIDDEN, "Login was denied"),
            AuthError::InvalidState(_) => {
                (StatusCode::BAD_REQUEST, "Login expired, please try again")
            }
            AuthError::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::RefreshFailed(_) | AuthError::SessionInvalid => {
                (StatusCode::UNAUTHORIZED, "Not authenticated")
            }
            AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        tracing::debug!("{}, {}", status, error_message);

        let body = Json(json!({
            "error": error_message,
        }));
        (status, body).into_response()
    }
}
