//! Build plan resolver.
//!
//! The plan is derived purely from the new facet hashes, the persisted
//! ones, and the set of dependencies that still need building. Rules are
//! checked in priority order and the first match wins.

use fleet_core::{
    BuildKind, BuildPlan, CronPlan, Facet, Hashes, MissingDependencySet, ResolvedRuntime,
    TaskPlan,
};

/// What the persisted record says about the function.
#[derive(Debug, Clone, Copy)]
pub struct Previous<'a> {
    pub hashes: &'a Hashes,
    pub runtime: &'a ResolvedRuntime,
    pub static_ip: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub hashes: &'a Hashes,
    pub runtime: &'a ResolvedRuntime,
    pub static_ip: bool,
    pub missing: &'a MissingDependencySet,
    /// `None` for a function that has never been deployed.
    pub previous: Option<Previous<'a>>,
}

pub fn resolve_plan(input: &PlanInput<'_>) -> BuildPlan {
    let Some(previous) = input.previous else {
        return BuildPlan {
            build: BuildKind::FullBuild,
            cron: if input.hashes.is_empty_facet(Facet::Schedule) {
                CronPlan::None
            } else {
                CronPlan::Set
            },
            task: if input.hashes.is_empty_facet(Facet::Tasks) {
                TaskPlan::None
            } else {
                TaskPlan::Update
            },
            is_new_function: true,
        };
    };

    let changed = |facet| input.hashes.changed(previous.hashes, facet);
    let cron = cron_plan(input.hashes, previous.hashes);
    let task = if changed(Facet::Tasks) {
        TaskPlan::Update
    } else {
        TaskPlan::None
    };

    let runtime_changed = changed(Facet::Runtime);
    let layer_transition = runtime_changed
        && (input.runtime.uses_custom_layer() || previous.runtime.uses_custom_layer());

    // Dependency builds, layer attachment and VPC attachment are all slow.
    let build = if !input.missing.is_empty()
        || layer_transition
        || input.static_ip != previous.static_ip
    {
        BuildKind::FullBuild
    } else if runtime_changed || changed(Facet::Dependencies) || changed(Facet::Code) {
        BuildKind::PartialBuild
    } else if changed(Facet::Configuration)
        || changed(Facet::Serialized)
        || changed(Facet::Compute)
        || cron != CronPlan::None
    {
        BuildKind::ConfigurationUpdate
    } else if [Facet::Security, Facet::Routes, Facet::Editor, Facet::Metadata]
        .into_iter()
        .any(changed)
    {
        BuildKind::MetadataUpdate
    } else {
        BuildKind::None
    };

    BuildPlan {
        build,
        cron,
        task,
        is_new_function: false,
    }
}

fn cron_plan(new: &Hashes, previous: &Hashes) -> CronPlan {
    if !new.changed(previous, Facet::Schedule) {
        return CronPlan::None;
    }
    match (
        new.is_empty_facet(Facet::Schedule),
        previous.is_empty_facet(Facet::Schedule),
    ) {
        (true, true) => CronPlan::None,
        (true, false) => CronPlan::Cancel,
        (false, true) => CronPlan::Set,
        (false, false) => CronPlan::Update,
    }
}
