use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use spark_buffer::BufferError;
use spark_shared::ProtocolError;
use spark_store::StoreError;

/// Failures of chat session and flush operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("you are not a participant of this chat")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    /// Store, buffer or trigger failure. Retrying may succeed.
    #[error("{0}")]
    Transient(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ChatError::NotFound(what),
            other => ChatError::Transient(other.to_string()),
        }
    }
}

impl From<BufferError> for ChatError {
    fn from(e: BufferError) -> Self {
        ChatError::Transient(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing or invalid signature")]
    InvalidSignature,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::InvalidSignature => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: ChatError = StoreError::NotFound("chat c1".into()).into();
        assert!(matches!(err, ChatError::NotFound(ref w) if w == "chat c1"));
        assert_eq!(err.to_string(), "chat c1 not found");
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServerError::InvalidSignature, StatusCode::UNAUTHORIZED),
            (ServerError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ServerError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
