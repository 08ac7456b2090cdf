//! fleet-compute — keeps the compute resource of a function in step with its specification.
//!
//! [`ComputeProvisioner`] creates or updates the resource, waits for it to
//! settle between mutations, and publishes an immutable version.
//! [`VersionCollector`] trims superseded versions some time after each
//! update.

pub mod error;
pub mod gc;
pub mod provisioner;

pub use error::{ComputeError, ComputeResult};
pub use gc::VersionCollector;
pub use provisioner::{ComputeProvisioner, Deployment};
