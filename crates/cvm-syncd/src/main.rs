//! cvm-syncd - vCenter to SDN controller synchronization daemon
//!
//! Entry point for the cvm-syncd daemon.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use clap::Parser;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use cvm_sync_common::{CvmError, EXIT_DEFECT};
use cvm_syncd::{
    filter_directive, local_hostname, CvmConfig, CvmContext, IntrospectConfig,
    LoggingControllerClient, ReplayInventoryClient, DEFAULT_CONFIG_PATH,
};

#[derive(Debug, Parser)]
#[command(name = "cvm-syncd", version, about = "vCenter to SDN controller synchronization daemon")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Initializes tracing/logging subsystem
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &CvmConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directive(&config.logging.level)?)?,
    };

    let writer = match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))?;
    Ok(())
}

fn build_context(config: &CvmConfig) -> anyhow::Result<CvmContext> {
    let Some(replay_file) = &config.simulation.replay_file else {
        bail!("no vCenter API client is linked into this build; set simulation.replay_file");
    };

    info!(file = %replay_file.display(), "Simulation mode");
    let inventory = Arc::new(ReplayInventoryClient::from_file(replay_file)?);
    let controller = Arc::new(LoggingControllerClient::new());
    Ok(CvmContext::build(&config.vlan, inventory, controller)?)
}

/// Maps a finished engine task to the process exit status.
fn task_exit(
    task: &str,
    result: Result<Result<std::convert::Infallible, CvmError>, JoinError>,
) -> ExitCode {
    match result {
        Ok(Ok(never)) => match never {},
        Ok(Err(e)) => {
            error!(task, error = %e, "Fatal error");
            error!("Restarting...");
            ExitCode::from(e.exit_code())
        }
        Err(e) => {
            error!(task, error = %e, "Task terminated abnormally");
            ExitCode::from(EXIT_DEFECT)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match CvmConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cvm-syncd: {e}");
            return ExitCode::from(e.exit_code());
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("cvm-syncd: {e:#}");
        return ExitCode::from(EXIT_DEFECT);
    }

    info!("--- Starting cvm-syncd ---");
    let introspect = IntrospectConfig::derive(&config, local_hostname(), &mut rand::thread_rng());
    info!(?introspect, "Introspect configuration");

    let context = match build_context(&config) {
        Ok(context) => context,
        Err(e) => {
            error!("Bootstrap failed: {e:#}");
            return ExitCode::from(EXIT_DEFECT);
        }
    };

    let CvmContext {
        state,
        mut supervisor,
        mut monitor,
    } = context;
    let mut supervise = tokio::spawn(async move { supervisor.supervise().await });
    let mut monitoring = tokio::spawn(async move { monitor.monitor().await });

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            ExitCode::SUCCESS
        }
        result = &mut supervise => task_exit("supervisor", result),
        result = &mut monitoring => task_exit("monitor", result),
    };
    supervise.abort();
    monitoring.abort();

    let snapshot = state.snapshot().await;
    info!(
        vms = snapshot.vms.len(),
        networks = snapshot.networks.len(),
        interfaces = snapshot.interfaces.len(),
        vlans = snapshot.allocated_vlans.len(),
        "Final state"
    );
    code
}
