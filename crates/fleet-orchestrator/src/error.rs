//! Error types for orchestration and their normalized form.

use std::time::Duration;

use thiserror::Error;

use fleet_core::{CoreError, ErrorInfo};

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),

    #[error("the function asks for {action} on {resource}, which the caller does not hold")]
    PermissionDenied { action: String, resource: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Deps(#[from] fleet_deps::DepsError),

    #[error(transparent)]
    Builder(#[from] fleet_builder::BuilderError),

    #[error(transparent)]
    Compute(#[from] fleet_compute::ComputeError),

    #[error(transparent)]
    Schedule(#[from] fleet_schedule::ScheduleError),

    #[error(transparent)]
    State(#[from] fleet_state::StateError),

    #[error("build {0} not found")]
    BuildNotFound(String),

    #[error("build {build_id} did not finish within {waited:?}")]
    WaitTimeout { build_id: String, waited: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::Validation(_) => 400,
            OrchestratorError::PermissionDenied { .. } => 403,
            OrchestratorError::Core(e) => match e {
                CoreError::InvalidManifest(_) | CoreError::InvalidEncoding { .. } => 400,
                CoreError::ConfigIo(_)
                | CoreError::ConfigParse(_)
                | CoreError::InvalidConfig(_) => 500,
            },
            OrchestratorError::Deps(e) => e.status_code(),
            OrchestratorError::Builder(e) => e.status_code(),
            OrchestratorError::Compute(e) => e.status_code(),
            OrchestratorError::Schedule(e) => e.status_code(),
            OrchestratorError::State(_) | OrchestratorError::Internal(_) => 500,
            OrchestratorError::BuildNotFound(_) => 404,
            OrchestratorError::WaitTimeout { .. } => 504,
        }
    }

    /// The `{statusCode, message, cause}` form recorded on a failed build.
    pub fn to_error_info(&self) -> ErrorInfo {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }
        ErrorInfo {
            status_code: self.status_code(),
            message: self.to_string(),
            cause: (!causes.is_empty()).then(|| causes.join(": ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provider::ProviderError;

    #[test]
    fn provider_failures_keep_their_cause() {
        let err: OrchestratorError = fleet_builder::BuilderError::Provider(ProviderError::throttled(
            "rate exceeded",
        ))
        .into();
        let info = err.to_error_info();
        assert_eq!(info.status_code, 429);
        assert!(info.message.contains("rate exceeded"));
        assert!(info.cause.unwrap().contains("throttled"));
    }

    #[test]
    fn validation_errors_have_no_cause() {
        let info = OrchestratorError::Validation("bad cron".into()).to_error_info();
        assert_eq!(info.status_code, 400);
        assert_eq!(info.message, "bad cron");
        assert!(info.cause.is_none());
    }

    #[test]
    fn quarantine_maps_to_429() {
        let err: OrchestratorError = fleet_deps::DepsError::Quarantined {
            name: "left-pad".into(),
            version: "1.0.0".into(),
            runtime: "nodejs18.x".into(),
            retry_at: chrono::Utc::now(),
            last_error: None,
        }
        .into();
        assert_eq!(err.status_code(), 429);
    }
}
