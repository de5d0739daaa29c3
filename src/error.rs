/// Unified error types for the metadata resolver
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for metadata resolution and artifact storage
#[derive(Error, Debug)]
pub enum MetadataError {
    /// Bad input to a constructor or operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or inconsistent configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Component used before initialize() or after destroy()
    #[error("Component not initialized: {0}")]
    NotInitialized(String),

    /// Origin source could not be read (network error, malformed source)
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// A filter rejected the document as malformed or untrusted
    #[error("Filter '{filter}' rejected metadata: {reason}")]
    FilterFailed { filter: String, reason: String },

    /// Foreground resolution failure, wrapping the fetch or filter cause
    #[error("Resolution failed for {criteria}: {source}")]
    ResolutionFailed {
        criteria: String,
        #[source]
        source: Box<MetadataError>,
    },

    /// Persistent cache key collision
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Storage-backed artifact map refused to overwrite an artifact
    #[error("Duplicate artifact: {0}")]
    DuplicateArtifact(String),

    /// Artifact storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Only produced at the HTTP surface; the engine reports absence as an empty result
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encode/decode errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Wrap a fetch or filter failure raised while resolving `criteria`
    pub fn resolution_failed(criteria: impl ToString, source: MetadataError) -> Self {
        MetadataError::ResolutionFailed {
            criteria: criteria.to_string(),
            source: Box::new(source),
        }
    }

    pub fn filter_failed(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        MetadataError::FilterFailed {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// True for the "resolution failed" category of the taxonomy
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            MetadataError::ResolutionFailed { .. }
                | MetadataError::FetchFailed(_)
                | MetadataError::FilterFailed { .. }
        )
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert MetadataError to HTTP response
impl IntoResponse for MetadataError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            MetadataError::InvalidArgument(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            MetadataError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "NotFound",
                self.to_string(),
            ),
            MetadataError::NotInitialized(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NotReady",
                self.to_string(),
            ),
            MetadataError::ResolutionFailed { .. }
            | MetadataError::FetchFailed(_)
            | MetadataError::FilterFailed { .. } => (
                StatusCode::BAD_GATEWAY,
                "ResolutionFailed",
                self.to_string(),
            ),
            MetadataError::AlreadyExists(_) | MetadataError::DuplicateArtifact(_) => (
                StatusCode::CONFLICT,
                "Conflict",
                self.to_string(),
            ),
            MetadataError::Database(_) | MetadataError::Internal(_) | MetadataError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_failed_keeps_source() {
        let err = MetadataError::resolution_failed(
            "entityID=https://idp.example.org",
            MetadataError::filter_failed("RequiredValidUntil", "missing validUntil"),
        );

        assert!(err.is_resolution_failure());
        let message = err.to_string();
        assert!(message.contains("https://idp.example.org"));
        assert!(message.contains("missing validUntil"));
    }

    #[test]
    fn test_not_found_is_not_a_resolution_failure() {
        assert!(!MetadataError::NotFound("x".to_string()).is_resolution_failure());
    }

    #[test]
    fn test_status_codes() {
        let resp = MetadataError::NotFound("x".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = MetadataError::FetchFailed("boom".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = MetadataError::DuplicateArtifact("AAQ".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
