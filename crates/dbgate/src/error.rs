use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::backend::BackendError;

/// Everything a `/handle/...` request can fail with.
///
/// The rendered message is sent to the client as the response body so the UI can
/// show it verbatim.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request body did not match the operation's parameters.
    #[error("{0}")]
    Decode(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("debug session has ended")]
    SessionEnded,

    #[error("No path provided")]
    NoPath,

    #[error("Illegal file access")]
    IllegalFileAccess,

    #[error("{0}")]
    FileRead(#[source] std::io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Decode(_)
            | GatewayError::Backend(BackendError::Rejected(_))
            | GatewayError::NoPath
            | GatewayError::IllegalFileAccess => StatusCode::BAD_REQUEST,
            GatewayError::Backend(BackendError::Unavailable(_))
            | GatewayError::Encode(_)
            | GatewayError::SessionEnded
            | GatewayError::FileRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
