mod cluster;
mod config;
mod generator;
mod handlers;
mod master;
mod orchestrator;
mod slot;

#[cfg(test)]
mod generator_test;
#[cfg(test)]
mod handlers_test;
#[cfg(test)]
mod testing;

use clap::Parser;
use config::LauncherConfig;
use master::ApplicationMaster;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Launch a parameter-server job on a cluster
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// launcher config in yaml
    config: PathBuf,
    /// debug logging and diagnostics in the generated launch scripts
    #[arg(short, long)]
    verbose: bool,
    /// override job.servers
    #[arg(long)]
    servers: Option<usize>,
    /// override job.workers
    #[arg(long)]
    workers: Option<usize>,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let mut config = LauncherConfig::load(&args.config).unwrap_or_log();

    if let Some(servers) = args.servers {
        config.job.servers = servers;
    }

    if let Some(workers) = args.workers {
        config.job.workers = workers;
    }

    config.verbose |= args.verbose;

    if config.preflight_checks() {
        error!("Config failed preflight checks, see the errors above");
        exit(1);
    }

    let master = ApplicationMaster::load(config).unwrap_or_log();

    match master.run() {
        Ok(outcome) => {
            info!(exit_code = outcome.exit_code(), "Launcher finished");
            exit(outcome.exit_code())
        }
        Err(error) => {
            error!(error = ?error, "Launcher failed: {error}");
            exit(1)
        }
    }
}
