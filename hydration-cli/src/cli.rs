//! Command line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Pulls changed objects from the producer bucket into the consumer bucket.
///
/// Bucket, role and key settings come from the environment; see
/// `SyncConfig::from_env` for the variable names.
#[derive(Parser, Debug)]
#[command(name = "s3-hydration")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Trigger payload as JSON, e.g. `{"forceFullSync": true, "keyPrefix": "data/"}`.
    #[arg(long, env = "HYDRATION_TRIGGER")]
    pub payload: Option<String>,

    /// Read the trigger payload from a file instead.
    #[arg(long, conflicts_with = "payload")]
    pub payload_file: Option<PathBuf>,

    /// Wall-clock budget for this run in seconds (overrides RUN_BUDGET_SECS).
    #[arg(long)]
    pub budget_secs: Option<u64>,

    /// Exit non-zero when any object failed, so the run is dead-lettered.
    #[arg(long)]
    pub fail_on_object_errors: bool,

    /// Serve Prometheus metrics on this address for the life of the run.
    #[arg(long, env = "METRICS_LISTEN")]
    pub metrics_listen: Option<SocketAddr>,

    /// Write Prometheus metrics to this file once the run ends, for a
    /// node-exporter textfile collector.
    #[arg(long, env = "METRICS_FILE", conflicts_with = "metrics_listen")]
    pub metrics_file: Option<PathBuf>,
}
