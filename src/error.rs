//! Error types shared by the storage layer, the processor and the HTTP surface.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::sync::Arc;
use thiserror::Error;

/// Crate-wide error.
///
/// Absence of an item is never an error: storage contracts report it as `None`/`false`.
#[derive(Debug, Error)]
pub enum Error {
    /// A mutating call without an asserted owner or package name.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("copy of {path} failed: {status}")]
    CopyFailed { path: String, status: String },

    #[error("copy of {0} did not complete in time")]
    CopyTimeout(String),

    #[error("missing package {0}")]
    MissingPackage(String),

    #[error("corrupted package: {0}")]
    CorruptedPackage(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("introspection failed: {0}")]
    Introspection(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Failure of a request another caller started and this caller awaited.
    #[error("{0}")]
    Shared(Arc<Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration format error: {0}")]
    ConfigFormat(#[from] serde_yaml::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation(message.into())
    }

    /// Unwraps shared errors so callers can match on the original variant.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self.root() {
            Error::InvalidOperation(_) | Error::CorruptedPackage(_) | Error::NotSupported(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_errors_keep_their_status() {
        let error = Error::Shared(Arc::new(Error::invalid_operation("no owner")));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert!(matches!(error.root(), Error::InvalidOperation(_)));

        let error = Error::CopyTimeout("pkg/new/a".to_string());
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
