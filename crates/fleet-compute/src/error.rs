//! Error types for compute provisioning.

use fleet_provider::{ErrorKind, ProviderError};
use thiserror::Error;

pub type ComputeResult<T> = Result<T, ComputeError>;

#[derive(Debug, Error)]
pub enum ComputeError {
    /// A provider call failed terminally.
    #[error("{operation} {resource} failed: {source}")]
    Provider {
        operation: &'static str,
        resource: String,
        #[source]
        source: ProviderError,
    },

    #[error("function {resource} no longer exists and there is no package to recreate it from")]
    NoPackage { resource: String },
}

impl ComputeError {
    pub(crate) fn provider(operation: &'static str, resource: &str, source: ProviderError) -> Self {
        ComputeError::Provider {
            operation,
            resource: resource.to_string(),
            source,
        }
    }

    /// Underlying provider error code, when there is one.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            ComputeError::Provider { source, .. } => Some(&source.code),
            ComputeError::NoPackage { .. } => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ComputeError::Provider { source, .. } => match source.kind {
                ErrorKind::NotFound => 404,
                ErrorKind::Conflict | ErrorKind::AlreadyExists => 409,
                ErrorKind::Throttled => 429,
                ErrorKind::Invalid => 400,
                ErrorKind::Timeout => 504,
                ErrorKind::Unavailable | ErrorKind::Other => 502,
            },
            ComputeError::NoPackage { .. } => 404,
        }
    }
}
