//! fleet-builder — compiles dependencies and deployment packages.
//!
//! Builds run inside ephemeral builder functions on the compute provider.
//! Builders are content-addressed by kind, runtime, package, and builder
//! version, created on first use, and invoked with pre-signed transfer
//! locations so they never hold storage credentials.
//!
//! Every module build records its outcome as artifact metadata. A failure
//! quarantines the `(runtime, name, version)` artifact for a window that
//! grows with each repeated failure.

pub mod driver;
pub mod error;
pub mod modules;
pub mod names;
pub mod package;

pub use driver::BuilderDriver;
pub use error::{BuilderError, BuilderResult};
pub use names::{function_builder_name, module_builder_name, module_artifact_key};
