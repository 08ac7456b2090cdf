//! fleet-state — persisted control-plane state.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the last successful
//! record of every function, the status and request payload of every
//! in-flight build, the per-artifact build metadata consulted by the
//! dependency resolver, and the derived search tags.
//!
//! Values are JSON-serialized into `&[u8]` columns under `&str` keys.
//! `StateStore` is `Clone + Send + Sync` and can be shared across tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
