use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Body returned to clients whenever the backend cannot be reached.
pub const BAD_GATEWAY_BODY: &str = "Bad Gateway";

/// Failure while forwarding a single request to the backend.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid backend target: {0}")]
    InvalidTarget(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        // Backend details stay in the log
        tracing::error!(error = %self, "Proxy request failed");
        (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response()
    }
}
