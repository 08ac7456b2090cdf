//! fleet-core — shared types for the Fleet function control plane.
//!
//! Everything the other crates agree on lives here: the function
//! specification, build plans and build status, dependency records,
//! the facet hashing engine, package manifest parsing, and the TOML
//! configuration.

pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod spec;
pub mod types;

pub use config::FleetConfig;
pub use error::{CoreError, CoreResult};
pub use hash::{Facet, Hashes, compute_hashes};
pub use manifest::PackageManifest;
pub use spec::*;
pub use types::*;
