use crate::core::error::ServiceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::error;
use serde_json::json;

pub mod conversations;
pub mod documents;

/// Error returned by the HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::ConversationNotFound(_) | ServiceError::MessageNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            ServiceError::InvalidDocumentId(_) => ApiError::bad_request(e.to_string()),
            ServiceError::Database(_) => {
                error!("{e}");
                ApiError::internal("internal server error")
            }
        }
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/conversations", conversations::router())
        .merge(documents::router())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
