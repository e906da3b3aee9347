//! kubestrap
//!
//! Brings a fleet of Debian-family hosts to a running Kubernetes cluster:
//! one control plane, any number of workers, re-runnable at any time.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use kubestrap_core::{CoreError, OrchestratorActorArgs, RunEvent, run_pipeline};
use kubestrap_exec::ReqwestFetcher;
use kubestrap_provision::bootstrap_pipeline;

mod config;
mod factory;
mod output;

use config::{CONFIG_ENV, Config};
use factory::HostExecutorFactory;

const EXIT_PIPELINE_FAILED: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "kubestrap")]
#[command(version, about = "Idempotent multi-node Kubernetes bootstrap", long_about = None)]
struct Cli {
    /// Inventory and cluster settings (TOML)
    #[arg(env = CONFIG_ENV)]
    inventory: Option<PathBuf>,

    /// Only run on hosts in this role
    #[arg(long, value_name = "ROLE")]
    limit: Option<String>,

    /// Check every step without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Print the run report as JSON and log as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(level: &str, verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print progress until the run finishes or the channel closes
fn spawn_printer(mut rx: broadcast::Receiver<RunEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(RunEvent::RunFinished { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
                Ok(event) => {
                    if let Some(line) = output::event_line(&event) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "progress output fell behind");
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match Config::locate(cli.inventory.clone()).and_then(|path| Config::load(&path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:?}");
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };
    init_tracing(&config.run.log_level, cli.verbose, cli.json);

    let inventory = match config.inventory(cli.limit.as_deref()) {
        Ok(inventory) => Arc::new(inventory),
        Err(e) => {
            eprintln!("Error: {e:?}");
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    info!(
        hosts = inventory.hosts().len(),
        limit = ?cli.limit,
        dry_run = cli.dry_run,
        "kubestrap starting"
    );

    let fetcher = Arc::new(ReqwestFetcher::new(config.run.http_timeout())?);
    let factory = Arc::new(
        HostExecutorFactory::new(config.run.connect_timeout())
            .with_key_env(config.run.ssh_key_env.clone()),
    );
    let (event_tx, event_rx) = broadcast::channel(1024);
    let printer = (!cli.json).then(|| spawn_printer(event_rx));

    let args = OrchestratorActorArgs {
        inventory,
        factory,
        fetcher,
        config: config.run_config(cli.dry_run),
        event_tx,
    };
    let result = run_pipeline(args, bootstrap_pipeline(&config.cluster)).await;

    if let Some(printer) = printer {
        if result.is_ok() {
            match tokio::time::timeout(Duration::from_secs(1), printer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "progress printer stopped early"),
                Err(_) => debug!("progress printer still draining, output dropped"),
            }
        } else {
            printer.abort();
        }
    }

    let report = match result {
        Ok(report) => report,
        Err(e @ CoreError::ActorError(_)) => return Err(e.into()),
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", output::summary(&report));
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PIPELINE_FAILED)
    })
}
