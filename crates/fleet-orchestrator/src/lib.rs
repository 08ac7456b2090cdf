//! fleet-orchestrator — from a submitted specification to a deployed function.
//!
//! The [`Orchestrator`] loads the persisted record of a function, resolves
//! the submitted settings, resolves dependencies, and computes a
//! [`BuildPlan`](fleet_core::BuildPlan) from the facet hashes. It then
//! persists a build status and request and runs the plan: builders,
//! compute resource, schedule, task queues, in that order.
//!
//! Full builds run in the background and are polled by build id. Every
//! other plan runs before `submit` returns.

pub mod context;
pub mod error;
pub mod plan;
pub mod settings;
pub mod worker;

pub use context::{DeployRequest, SubmitResponse};
pub use error::{OrchestratorError, OrchestratorResult};
pub use plan::{PlanInput, Previous, resolve_plan};
pub use settings::{ResolvedSettings, SettingsResolver};
pub use worker::{Orchestrator, Providers};
