//! fleet-schedule — recurring schedules and task queues of deployed functions.
//!
//! [`ScheduleManager`] registers schedule markers and pre-enqueues the
//! invocations due before the periodic scheduler next runs.
//! [`TaskQueueProvisioner`] reconciles the ordered and delayed queue pair
//! behind every task route.

pub mod error;
pub mod expression;
pub mod manager;
pub mod tasks;

pub use error::{ScheduleError, ScheduleResult};
pub use expression::{CronSchedule, parse_timezone};
pub use manager::ScheduleManager;
pub use tasks::TaskQueueProvisioner;
