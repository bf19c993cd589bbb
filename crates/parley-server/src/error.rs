use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::ProtocolError;
use parley_store::StoreError;

/// Failures inside a real-time event handler. Each one is turned into a
/// `message-error` event for the originating connection.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Validation failure. Reported to the sender only, never retried.
    #[error("{0}")]
    InvalidMessage(#[from] ProtocolError),

    /// A store operation failed. The pipeline aborts without retrying.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The connection has not announced an identity yet.
    #[error("Identity not announced")]
    NotBound,
}

impl From<StoreError> for MessagingError {
    fn from(e: StoreError) -> Self {
        MessagingError::StoreUnavailable(e.to_string())
    }
}

impl MessagingError {
    /// Text shown to the client. Store details stay in the server log.
    pub fn client_message(&self, event: &str) -> String {
        match self {
            MessagingError::StoreUnavailable(_) if event == "send-message" => {
                "Failed to send message".to_string()
            }
            MessagingError::StoreUnavailable(_) => format!("Failed to process {event}"),
            other => other.to_string(),
        }
    }
}

/// Errors returned by the REST surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MessagingError> for ServerError {
    fn from(e: MessagingError) -> Self {
        match e {
            MessagingError::InvalidMessage(inner) => ServerError::BadRequest(inner.to_string()),
            MessagingError::NotFound(what) => ServerError::NotFound(what.to_string()),
            MessagingError::Forbidden(msg) => ServerError::BadRequest(msg),
            MessagingError::NotBound => ServerError::BadRequest("Identity not announced".into()),
            MessagingError::StoreUnavailable(msg) => ServerError::Internal(msg),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
