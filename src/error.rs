//! Error types for the transfer coordinator

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer {request_id} already exists")]
    DuplicateRequestId { request_id: String },

    #[error("Block {block_id} is already bound to another transfer")]
    DuplicateBlockId { block_id: String },

    #[error("A waiter is already registered for block {block_id}")]
    AlreadyRegistered { block_id: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Status store error: {0}")]
    StoreWrite(#[from] sqlx::Error),

    #[error("Node {node_url} call failed: {message}")]
    Upstream { node_url: String, message: String },

    #[error("Node {node} is not configured")]
    UnknownNode { node: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub fn not_found(what: impl Into<String>) -> Self {
        TransferError::NotFound { what: what.into() }
    }

    pub fn upstream(node_url: &str, message: impl Into<String>) -> Self {
        TransferError::Upstream {
            node_url: node_url.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status surfaced by the API for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferError::DuplicateRequestId { .. }
            | TransferError::DuplicateBlockId { .. }
            | TransferError::AlreadyRegistered { .. } => StatusCode::CONFLICT,
            TransferError::NotFound { .. } => StatusCode::NOT_FOUND,
            TransferError::UnknownNode { .. } | TransferError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            TransferError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            TransferError::StoreWrite(_)
            | TransferError::Serialization(_)
            | TransferError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Result type for coordinator operations
pub type TransferResult<T> = Result<T, TransferError>;
