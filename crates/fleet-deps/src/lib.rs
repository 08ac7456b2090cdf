//! fleet-deps — dependency resolution for function packages.
//!
//! Requested ranges are resolved against the private registry when the
//! package belongs to one of its scopes, otherwise against public mirrors
//! raced under a shared deadline. Resolved versions are then checked
//! against the artifact metadata in the state store to find what still
//! needs building, honouring quarantine windows of failed builds.

pub mod error;
pub mod mirror;
pub mod range;
pub mod registry;
pub mod resolver;

pub use error::{DepsError, DepsResult};
pub use mirror::{HttpMirror, PublicMirror};
pub use range::NpmRange;
pub use registry::{MemoryRegistry, PackageVersions, RegistryClient};
pub use resolver::DependencyResolver;
