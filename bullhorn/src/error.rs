//! Crate-wide error taxonomy.
//!
//! Engine code branches on these closed variants; provider- or store-specific
//! error codes never leak past the layer that produces them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;
use crate::types::{CategoryId, ContactId};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller identity missing or malformed at the request boundary.
    #[error("not authenticated")]
    Unauthenticated,

    /// Input did not normalize to a valid E.164 number.
    #[error("invalid phone number: {input:?}")]
    InvalidPhoneNumber { input: String },

    /// Malformed message body or other request-level validation failure.
    /// Reported before any side effect.
    #[error("{0}")]
    InvalidMessage(String),

    #[error("category {0} not found")]
    CategoryNotFound(CategoryId),

    #[error("contact {0} not found")]
    ContactNotFound(ContactId),

    /// Some explicitly selected contact IDs could not be resolved. The whole
    /// job is rejected; nothing was sent.
    #[error("{} contact id(s) could not be resolved", missing.len())]
    PartialResolution { missing: Vec<ContactId> },

    /// A delivery callback referenced a provider message ID we never issued.
    /// Logged and ignored by the webhook handler, never fatal.
    #[error("no message record for provider id {0:?}")]
    UnknownMessageReference(String),

    /// Duplicate contact or other uniqueness conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistence layer failure; fatal for the current operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            EngineError::InvalidPhoneNumber { .. } | EngineError::InvalidMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::CategoryNotFound(_)
            | EngineError::ContactNotFound(_)
            | EngineError::PartialResolution { .. }
            | EngineError::UnknownMessageReference(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Store(_) | EngineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs, not the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = match &self {
            EngineError::PartialResolution { missing } => json!({
                "error": message,
                "missing": missing,
            }),
            _ => json!({ "error": message }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            EngineError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            EngineError::InvalidMessage("too long".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::Conflict("duplicate".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::PartialResolution {
                missing: vec![uuid::Uuid::nil()]
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::Store(StoreError::NotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
