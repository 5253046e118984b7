//! Bulk Import Daemon - Main Entry Point
//! `serve` runs the worker pools; `submit`, `status` and `cancel` drive jobs against the same database

mod app;
mod settings;

use anyhow::{Context, Result};
use app::Services;
use bulkimport_core::application::cancellation_pair;
use bulkimport_core::application::import::ImportRequest;
use clap::{Parser, Subcommand};
use serde::Serialize;
use settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "bulkimport", version, about = "Bulk resource import daemon")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, env = "BULKIMPORT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run crash recovery and the orchestrator/processing worker pools
    Serve,
    /// Submit an import job from a JSON request file
    Submit {
        /// `{"manifest": [{"resourceType": ..., "sourceUri": ...}], "options": {...}}`
        manifest: PathBuf,
        /// Overrides the job id in the request file
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Show the status of an import job
    Status { job_id: String },
    /// Request cancellation of an import job
    Cancel { job_id: String },
}

fn init_logging() -> Result<()> {
    let log_format = std::env::var("BULKIMPORT_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("bulkimport=info"))
        .context("Failed to create env filter")?;

    match log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let settings = Settings::load(cli.config.as_deref())?;
    let services = Services::build(&settings).await?;

    match cli.command {
        Command::Serve => {
            info!("Bulk Import Daemon v{} starting...", VERSION);
            let (source, token) = cancellation_pair();
            let services = Arc::new(services);
            let server = {
                let services = services.clone();
                tokio::spawn(async move { services.serve(token).await })
            };

            info!("Press Ctrl+C to shutdown");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received. Exiting gracefully...");

            source.cancel();
            server.await??;
            info!("Shutdown complete.");
        }
        Command::Submit { manifest, job_id } => {
            let raw = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Cannot read {}", manifest.display()))?;
            let mut request: ImportRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid import request in {}", manifest.display()))?;
            if job_id.is_some() {
                request.job_id = job_id;
            }

            let job_id = services.jobs.submit(request).await?;
            print_json(&serde_json::json!({ "jobId": job_id }))?;
        }
        Command::Status { job_id } => {
            print_json(&services.jobs.get_status(&job_id).await?)?;
        }
        Command::Cancel { job_id } => {
            print_json(&services.jobs.cancel(&job_id).await?)?;
        }
    }

    Ok(())
}
