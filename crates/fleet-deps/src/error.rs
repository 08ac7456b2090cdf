//! Error types for dependency resolution.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type DepsResult<T> = Result<T, DepsError>;

#[derive(Debug, Error)]
pub enum DepsError {
    #[error("dependency {name} has an invalid version range {range:?}: {reason}")]
    InvalidRange {
        name: String,
        range: String,
        reason: String,
    },

    #[error("no version of {name} satisfies {range} in {source_name}")]
    NoMatchingVersion {
        name: String,
        range: String,
        source_name: String,
    },

    #[error("unable to resolve {name}@{range}: {reasons}")]
    Unresolvable {
        name: String,
        range: String,
        reasons: String,
    },

    #[error(
        "module {name}@{version} for runtime {runtime} failed to build previously and another attempt is delayed until {retry_at}{}",
        .last_error.as_deref().map(|e| format!(". Last error: {e}")).unwrap_or_default()
    )]
    Quarantined {
        name: String,
        version: String,
        runtime: String,
        retry_at: DateTime<Utc>,
        last_error: Option<String>,
    },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("mirror request failed: {0}")]
    Mirror(String),

    #[error(transparent)]
    State(#[from] fleet_state::StateError),
}

impl DepsError {
    pub fn status_code(&self) -> u16 {
        match self {
            DepsError::InvalidRange { .. }
            | DepsError::NoMatchingVersion { .. }
            | DepsError::Unresolvable { .. } => 400,
            DepsError::Quarantined { .. } => 429,
            DepsError::Registry(_) | DepsError::Mirror(_) => 502,
            DepsError::State(_) => 500,
        }
    }
}
