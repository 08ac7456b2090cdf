//! Provider error taxonomy.
//!
//! Every adapter maps its native failures onto an [`ErrorKind`] so the
//! recovery rules (create on not-found, wait on conflict, back off on
//! throttling) can be written once.

use std::fmt;

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    /// The resource is mid-update or a conflicting operation is running.
    Conflict,
    AlreadyExists,
    Throttled,
    /// The provider rejected the request itself.
    Invalid,
    Unavailable,
    /// A convergence wait ran past its deadline.
    Timeout,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized provider failure carrying the provider's own code and message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} ({code}): {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, "ResourceNotFound", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, "ResourceConflict", message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, "ResourceAlreadyExists", message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Throttled, "TooManyRequests", message)
    }

    pub fn timeout(resource: &str, state: &str) -> Self {
        Self::new(
            ErrorKind::Timeout,
            "ConvergenceTimeout",
            format!("{resource} did not become ready, last observed state: {state}"),
        )
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}
