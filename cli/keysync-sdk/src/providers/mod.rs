pub mod blob;
pub mod breaker;
pub mod org;
pub mod source;
pub mod store;

use std::fmt::{self, Display, Formatter};

use keysync_core::path::PathError;
use thiserror::Error;

/// The logical services the pipeline talks to. One circuit breaker
/// exists per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Source,
    TargetStore,
    BlobStore,
    Discovery,
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::TargetStore => "target_store",
            Self::BlobStore => "blob_store",
            Self::Discovery => "discovery",
        };
        write!(f, "{name}")
    }
}

/// Error kinds shared by every outbound client.
///
/// The kind decides policy: only [`ClientError::Transient`] and
/// [`ClientError::RateLimited`] are retried and counted toward the
/// breaker; everything else surfaces immediately. Messages name the
/// operation and path but never secret values.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("{operation}: {path:?} not found")]
    NotFound { operation: &'static str, path: String },
    #[error("{operation}: {path:?} already exists")]
    AlreadyExists { operation: &'static str, path: String },
    #[error("{operation}: permission denied")]
    PermissionDenied { operation: &'static str },
    #[error("{operation}: rate limited")]
    RateLimited { operation: &'static str },
    #[error("{operation}: transient failure: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },
    #[error("circuit breaker for {service} is open")]
    BreakerOpen { service: ServiceKind },
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn not_found(operation: &'static str, path: impl Into<String>) -> Self {
        Self::NotFound {
            operation,
            path: path.into(),
        }
    }

    pub fn transient(operation: &'static str, message: impl Display) -> Self {
        Self::Transient {
            operation,
            message: message.to_string(),
        }
    }

    /// Whether the retry loop may attempt this call again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    /// Whether this outcome counts as a failure for the breaker window.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_retriable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Map an HTTP status to the shared error taxonomy.
pub(crate) fn error_from_status(
    operation: &'static str,
    path: &str,
    status: reqwest::StatusCode,
) -> ClientError {
    match status {
        reqwest::StatusCode::NOT_FOUND => ClientError::not_found(operation, path),
        reqwest::StatusCode::CONFLICT => ClientError::AlreadyExists {
            operation,
            path: path.to_string(),
        },
        reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::UNAUTHORIZED => {
            ClientError::PermissionDenied { operation }
        },
        reqwest::StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited { operation },
        status => ClientError::transient(operation, format_args!("unexpected status {status}")),
    }
}
