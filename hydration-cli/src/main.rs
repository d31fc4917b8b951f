//! Scheduler-facing entry point: one invocation performs one sync run.
//!
//! The JSON run summary goes to stdout; logs go to stderr. A run-level
//! failure exits non-zero so the invocation can be dead-lettered and replayed.
//! A Prometheus recorder is always installed; `--metrics-listen` serves it
//! over HTTP and `--metrics-file` writes it out once the run ends.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hydration_sync::report::describe_metrics;
use hydration_sync::{SyncConfig, SyncEngine, TriggerPayload};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let metrics = match init_metrics(&cli) {
        Ok(handle) => handle,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(&cli).await;

    if let (Some(handle), Some(path)) = (&metrics, &cli.metrics_file)
        && let Err(e) = write_metrics(handle, path)
    {
        error!("{e:#}");
        return ExitCode::FAILURE;
    }

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<ExitCode> {
    let raw_payload = match &cli.payload_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read trigger payload {}", path.display()))?,
        ),
        None => cli.payload.clone(),
    };
    let trigger = TriggerPayload::parse(raw_payload.as_deref())?;

    let mut config = SyncConfig::from_env().context("failed to load configuration")?;
    if let Some(budget) = cli.budget_secs {
        config.run_budget_secs = budget;
        config.validate().context("invalid --budget-secs")?;
    }

    let engine = SyncEngine::connect(Arc::new(config)).await;
    let summary = engine.run(&trigger).await.context("sync run failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("failed to encode run summary")?
    );

    if cli.fail_on_object_errors && summary.failed > 0 {
        warn!("{} object(s) failed to transfer", summary.failed);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Installs the global recorder. Returns a handle for rendering unless an
/// HTTP listener owns the exposition.
fn init_metrics(cli: &Cli) -> Result<Option<PrometheusHandle>> {
    let handle = match cli.metrics_listen {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("failed to install Prometheus exporter")?;
            info!("metrics endpoint listening on http://{addr}/metrics");
            None
        }
        None => Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("failed to install Prometheus recorder")?,
        ),
    };
    describe_metrics();
    Ok(handle)
}

fn write_metrics(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    std::fs::write(path, handle.render())
        .with_context(|| format!("failed to write metrics to {}", path.display()))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
