use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::orchestrator::SessionError;
use crate::session::RegistryError;

/// Errors returned by HTTP handlers.
///
/// The `Display` text is the human-readable message; [`ApiError::code`] is
/// the stable string clients should match on. Rendered as
/// `{"error":{"code":..,"message":..}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}.")]
    InvalidRequest(String),
    #[error("Session not found: {0}.")]
    SessionNotFound(String),
    /// The protocol side refused or failed the pairing request.
    #[error("Pairing failed: {0}.")]
    PairingFailed(String),
    #[error("Too many active sessions. Try again shortly.")]
    CapacityReached,
    #[error("Server is shutting down.")]
    ShuttingDown,
    #[error("Failed to create session: {0}.")]
    SessionCreateFailed(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            Self::PairingFailed(_) => (StatusCode::BAD_GATEWAY, "pairing_failed"),
            Self::CapacityReached => (StatusCode::SERVICE_UNAVAILABLE, "capacity_reached"),
            Self::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Self::SessionCreateFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "session_create_failed")
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    pub fn code(&self) -> &'static str {
        self.parts().1
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidInput(detail) => Self::InvalidRequest(detail),
            SessionError::Registry(RegistryError::MaxSessionsReached) => Self::CapacityReached,
            SessionError::Registry(RegistryError::NotFound(id)) => Self::SessionNotFound(id),
            SessionError::Connect(e) => Self::PairingFailed(e.to_string()),
            SessionError::PairingRequest(e) => Self::PairingFailed(e.to_string()),
            other => {
                tracing::error!(error = %other, "session creation failed");
                Self::SessionCreateFailed(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = serde_json::json!({
            "error": { "code": code, "message": self.to_string() }
        });
        (status, Json(body)).into_response()
    }
}
