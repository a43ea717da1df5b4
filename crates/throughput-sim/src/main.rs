mod backend;
mod config;
mod logging;
mod runner;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use crate::config::{Cli, SimConfig};
use crate::runner::Simulation;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.metrics_file.as_ref());

    let config = SimConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    tracing::info!(
        resource_id = %config.resource_id,
        groups = config.groups.len(),
        workloads = config.workloads.len(),
        instances = cli.instances,
        duration = ?cli.duration(),
        "Starting throughput simulation"
    );

    let simulation = Simulation::new(config, cli.instances);
    let report = simulation.run(cli.duration()).await?;

    for (name, workload) in &report.workloads {
        tracing::info!(
            workload = %name,
            succeeded = workload.succeeded,
            not_found = workload.not_found,
            client_throttled = workload.client_throttled,
            server_throttled = workload.server_throttled,
            charged = workload.charged,
            "Workload finished"
        );
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode report")?
    );
    Ok(())
}
