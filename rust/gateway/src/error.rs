use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    /// Non-2xx answer from the ASP or the node, surfaced with its own status.
    #[error("upstream returned {status}")]
    Upstream { status: u16, detail: String },
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Upstream { status, detail } => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                (
                    code,
                    Json(json!({
                        "error": "upstream error",
                        "status": status,
                        "detail": detail,
                    })),
                )
                    .into_response()
            }
            other => {
                let status = match &other {
                    GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
                    GatewayError::Unreachable(_) => StatusCode::BAD_GATEWAY,
                    GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                    GatewayError::Internal(_) | GatewayError::Upstream { .. } => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    warn!(error = %other, "request failed");
                }
                (status, Json(json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Unreachable(err.to_string())
    }
}
