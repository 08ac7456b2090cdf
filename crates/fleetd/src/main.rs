//! fleetd — the Fleet deployment daemon.
//!
//! Assembles the control plane around a redb state store and the
//! in-process providers:
//! - Settings resolution and build planning
//! - Dependency resolution against the configured public mirrors
//! - Builder driver, compute provisioner, schedules and task queues
//! - Version garbage collection
//!
//! # Usage
//!
//! ```text
//! fleetd plan   --spec ./hello --data-dir /var/lib/fleet
//! fleetd deploy --spec ./hello --force-rebuild
//! fleetd status --build-id 6f1c...
//! fleetd serve  --config /etc/fleet/fleet.toml
//! ```

mod local;
mod spec_source;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_core::FleetConfig;
use fleet_orchestrator::DeployRequest;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleet=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet deployment daemon")]
struct Cli {
    #[command(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Common {
    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/fleet")]
    data_dir: PathBuf,

    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the build plan a deployment would run, without running it.
    Plan {
        /// Specification file, or a directory holding function.json and the code.
        #[arg(long)]
        spec: PathBuf,
    },
    /// Deploy a function and wait for the build to finish.
    Deploy {
        #[arg(long)]
        spec: PathBuf,

        /// Rebuild every dependency, quarantined or not.
        #[arg(long)]
        force_rebuild: bool,
    },
    /// Print the status of a build.
    Status {
        #[arg(long)]
        build_id: String,
    },
    /// Resume interrupted builds and run until interrupted.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.common.config.as_deref())?;
    let orchestrator = local::assemble(&cli.common.data_dir, &config)?;

    match cli.command {
        Command::Plan { spec } => {
            let request = deploy_request(&spec, false)?;
            let plan = orchestrator.plan(&request).await?;
            print_json(&plan)
        }
        Command::Deploy {
            spec,
            force_rebuild,
        } => {
            let request = deploy_request(&spec, force_rebuild)?;
            let response = orchestrator.submit(request).await?;
            match response.build_id {
                Some(build_id) => {
                    info!(%build_id, "waiting for build");
                    let status = orchestrator
                        .wait_for(&build_id, config.convergence.deadline())
                        .await?;
                    print_json(&status)
                }
                None => print_json(&response),
            }
        }
        Command::Status { build_id } => print_json(&orchestrator.poll(&build_id)?),
        Command::Serve => {
            let resumed = orchestrator.resume_pending().await?;
            info!(resumed, "fleet daemon ready");
            tokio::signal::ctrl_c()
                .await
                .context("failed to install CTRL+C handler")?;
            info!("shutdown signal received");
            orchestrator.shutdown().await;
            info!("fleet daemon stopped");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    let config = match path {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FleetConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn deploy_request(spec: &Path, force_rebuild: bool) -> anyhow::Result<DeployRequest> {
    let spec = spec_source::load(spec)?;
    // Local callers hold every permission they ask for.
    let caller_permissions = spec.requested_permissions().into_iter().cloned().collect();
    Ok(DeployRequest {
        spec,
        caller_permissions,
        force_rebuild,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
