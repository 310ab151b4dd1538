use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use podfed::sync::SyncError;
use podfed::PodError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Another pod failed or refused to answer.
    #[error("Remote pod error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PodError> for ServerError {
    fn from(e: PodError) -> Self {
        match e {
            PodError::NotLocal(_) => ServerError::Forbidden(e.to_string()),
            PodError::VideoNotFound(_) | PodError::ContentNotFound(_) => {
                ServerError::NotFound(e.to_string())
            }
            PodError::AlreadyFriend(_) => ServerError::Conflict(e.to_string()),
            PodError::Validation(_) | PodError::Core(_) => ServerError::BadRequest(e.to_string()),
            PodError::Sync(
                SyncError::Delivery { .. }
                | SyncError::UnreachablePod(_)
                | SyncError::Rejected { .. }
                | SyncError::UnexpectedReply { .. }
                | SyncError::Transport(_),
            ) => ServerError::Upstream(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
