use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use tether_core::ids::SubChatId;
use tether_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no pending retry for sub-chat {0}")]
    NoPendingRetry(SubChatId),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Engine(EngineError::EmptyPrompt) => StatusCode::BAD_REQUEST,
            Self::NoPendingRetry(_) => StatusCode::NOT_FOUND,
            Self::Engine(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
