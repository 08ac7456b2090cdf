//! Error types for schedules and task queues.

use fleet_provider::{ErrorKind, ProviderError};
use thiserror::Error;

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),

    #[error("function {0} has no schedule to register")]
    MissingSchedule(String),

    #[error("failed to schedule {failed} imminent executions of the cron job: {reason}")]
    EnqueueFailed { failed: usize, reason: String },

    #[error("{operation} failed: {source}")]
    Provider {
        operation: &'static str,
        #[source]
        source: ProviderError,
    },
}

impl ScheduleError {
    pub(crate) fn provider(operation: &'static str, source: ProviderError) -> Self {
        ScheduleError::Provider { operation, source }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ScheduleError::InvalidCron { .. }
            | ScheduleError::InvalidTimezone(_)
            | ScheduleError::MissingSchedule(_) => 400,
            ScheduleError::EnqueueFailed { .. } => 502,
            ScheduleError::Provider { source, .. } => match source.kind {
                ErrorKind::NotFound => 404,
                ErrorKind::Conflict | ErrorKind::AlreadyExists => 409,
                ErrorKind::Throttled => 429,
                ErrorKind::Invalid => 400,
                ErrorKind::Timeout => 504,
                ErrorKind::Unavailable | ErrorKind::Other => 502,
            },
        }
    }
}
