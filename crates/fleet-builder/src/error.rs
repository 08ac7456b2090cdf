//! Error types for the builder driver.

use fleet_core::ErrorSource;
use fleet_provider::{ErrorKind, ProviderError};
use thiserror::Error;

pub type BuilderResult<T> = Result<T, BuilderError>;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("error building module {name}@{version}: {message}")]
    ModuleBuildFailed {
        name: String,
        version: String,
        message: String,
        source_kind: ErrorSource,
    },

    #[error("error building deployment package: {message}")]
    PackageBuildFailed {
        message: String,
        source_kind: ErrorSource,
    },

    #[error("builder {builder} still busy after {attempts} attempts")]
    BuilderBusy { builder: String, attempts: u32 },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] fleet_state::StateError),
}

impl BuilderError {
    pub fn status_code(&self) -> u16 {
        match self {
            BuilderError::ModuleBuildFailed { source_kind, .. }
            | BuilderError::PackageBuildFailed { source_kind, .. } => match source_kind {
                ErrorSource::Function => 400,
                ErrorSource::Infrastructure => 502,
            },
            BuilderError::BuilderBusy { .. } => 409,
            BuilderError::Provider(e) => match e.kind {
                ErrorKind::Throttled => 429,
                ErrorKind::Timeout => 504,
                ErrorKind::Conflict => 409,
                _ => 502,
            },
            BuilderError::State(_) => 500,
        }
    }
}
