use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgship::archive::{LocalTree, archive_to_file};
use imgship::config::{Config, load_config};
use imgship::deploy::{DeployPlan, Deployer};
use imgship::reconcile::Reconciler;
use imgship::runner::LocalRunner;
use imgship::transport::SshConnector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "imgship", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "imgship.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile images on the target host, then upload and start the workload
    Deploy {
        /// Print the deployment report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Only make sure the configured images exist on the target host
    Reconcile {
        /// Print the per-image results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a directory as a build-context tar archive, honouring .dockerignore
    Archive {
        /// Directory to archive
        dir: PathBuf,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Dockerfile to ship even if .dockerignore excludes it
        #[arg(short = 'f', long, default_value = "Dockerfile")]
        dockerfile: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting imgship {}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });

    match cli.command {
        Command::Deploy { json } => {
            let config = load(&cli.config)?;
            let plan = DeployPlan::from_config(&config)?;
            let deployer = Deployer::new(
                Arc::new(LocalRunner),
                Arc::new(SshConnector),
                config.retry.clone(),
                config.engine.clone(),
            );
            let report = deployer
                .deploy(&cancel, &plan, &config.transport)
                .await
                .with_context(|| {
                    format!("Deployment to {} failed", config.transport.destination())
                })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for transfer in &report.transfers {
                    println!("{}", transfer);
                }
            }
            if report.is_success() {
                info!(
                    "Deployment to {} complete in {}s",
                    report.destination,
                    report.elapsed().num_seconds()
                );
            } else {
                warn!(
                    "Deployment to {} complete with {} missing image(s)",
                    report.destination,
                    report.failed().count()
                );
            }
        }
        Command::Reconcile { json } => {
            let config = load(&cli.config)?;
            let reconciler = Reconciler::new(
                Arc::new(LocalRunner),
                Arc::new(SshConnector),
                config.retry.clone(),
                config.engine.clone(),
            );
            let results = reconciler
                .reconcile(&cancel, &config.image_requests()?, &config.transport)
                .await
                .context("Reconciliation failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for result in &results {
                    println!("{}", result);
                }
            }
            let failures = results.iter().filter(|result| !result.is_success()).count();
            if failures > 0 {
                error!(
                    "{} of {} image(s) could not be acquired",
                    failures,
                    results.len()
                );
                anyhow::bail!(
                    "{} image(s) missing on {}",
                    failures,
                    config.transport.destination()
                );
            }
        }
        Command::Archive {
            dir,
            output,
            dockerfile,
        } => {
            let tree = LocalTree::new(&dir)
                .with_context(|| format!("Failed to open {}", dir.display()))?
                .including(&dockerfile);
            let destination = output.clone();
            let count = tokio::task::spawn_blocking(move || archive_to_file(&tree, &destination))
                .await
                .context("Archive task panicked")?
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Archived {} file(s) from {} to {}",
                count,
                dir.display(),
                output.display()
            );
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<Config> {
    let config = load_config(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}
