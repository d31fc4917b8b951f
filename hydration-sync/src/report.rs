//! Outcome aggregation, metrics and the run summary.

use crate::types::{FailedObject, RunSummary, TransferOutcome, TransferStatus};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const OBJECTS_TRANSFERRED: &str = "hydration_objects_transferred";
pub const OBJECTS_SKIPPED: &str = "hydration_objects_skipped";
pub const OBJECTS_FAILED: &str = "hydration_objects_failed";
pub const BYTES_TRANSFERRED: &str = "hydration_bytes_transferred";
pub const RUN_DURATION: &str = "hydration_run_duration_seconds";
pub const RUNS: &str = "hydration_runs";
pub const RUN_OBJECTS_TRANSFERRED: &str = "hydration_run_objects_transferred";
pub const RUN_OBJECTS_SKIPPED: &str = "hydration_run_objects_skipped";
pub const RUN_OBJECTS_FAILED: &str = "hydration_run_objects_failed";
pub const RUN_BYTES_TRANSFERRED: &str = "hydration_run_bytes_transferred";

/// Registers help text for every metric with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(OBJECTS_TRANSFERRED, "Objects copied to the destination");
    describe_counter!(OBJECTS_SKIPPED, "Objects already present at the destination");
    describe_counter!(OBJECTS_FAILED, "Objects that failed after retries");
    describe_counter!(BYTES_TRANSFERRED, "Bytes copied to the destination");
    describe_counter!(RUNS, "Completed sync runs by outcome");
    describe_histogram!(RUN_DURATION, "Sync run duration in seconds");
    describe_counter!(RUN_OBJECTS_TRANSFERRED, "Objects copied, by run outcome");
    describe_counter!(RUN_OBJECTS_SKIPPED, "Objects skipped, by run outcome");
    describe_counter!(RUN_OBJECTS_FAILED, "Objects failed, by run outcome");
    describe_counter!(RUN_BYTES_TRANSFERRED, "Bytes copied, by run outcome");
}

#[derive(Default)]
struct AggregateState {
    outcomes: Vec<TransferOutcome>,
    transferred: usize,
    skipped: usize,
    failed: usize,
    bytes: u64,
}

/// Append-only outcome collection shared by all workers.
///
/// Holds its lock only for in-memory appends; no I/O happens under it.
#[derive(Default)]
pub struct RunAggregator {
    state: Mutex<AggregateState>,
}

impl RunAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one terminal outcome and bumps the matching counter.
    pub fn record(&self, outcome: TransferOutcome) {
        match outcome.status {
            TransferStatus::Transferred => {
                counter!(OBJECTS_TRANSFERRED).increment(1);
                counter!(BYTES_TRANSFERRED).increment(outcome.bytes);
            }
            TransferStatus::Skipped => counter!(OBJECTS_SKIPPED).increment(1),
            TransferStatus::Failed => counter!(OBJECTS_FAILED).increment(1),
        }

        let mut state = self.lock();
        match outcome.status {
            TransferStatus::Transferred => {
                state.transferred += 1;
                state.bytes += outcome.bytes;
            }
            TransferStatus::Skipped => state.skipped += 1,
            TransferStatus::Failed => state.failed += 1,
        }
        state.outcomes.push(outcome);
    }

    /// Snapshot of every outcome recorded so far.
    pub fn outcomes(&self) -> Vec<TransferOutcome> {
        self.lock().outcomes.clone()
    }

    pub fn attempted(&self) -> usize {
        self.lock().outcomes.len()
    }

    /// Materializes the final summary.
    pub fn summarize(
        &self,
        next_marker: Option<DateTime<Utc>>,
        time_boxed: bool,
        dry_run: bool,
        elapsed: Duration,
    ) -> RunSummary {
        let state = self.lock();
        let mut errors: Vec<FailedObject> = state
            .outcomes
            .iter()
            .filter_map(|o| {
                o.error.map(|kind| FailedObject {
                    key: o.key.clone(),
                    kind,
                })
            })
            .collect();
        errors.sort_by(|a, b| a.key.cmp(&b.key));

        RunSummary {
            transferred: state.transferred,
            skipped: state.skipped,
            failed: state.failed,
            next_marker,
            time_boxed,
            dry_run,
            bytes_transferred: state.bytes,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            errors,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        // A panicking worker cannot leave a half-written append behind
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Emits run-level metrics labelled with how the run ended.
///
/// The per-object counters bumped by `record` carry no label; the run
/// totals here repeat those counts under the outcome.
pub fn publish_run(summary: &RunSummary) {
    let outcome = summary.outcome().as_str();
    counter!(RUNS, "outcome" => outcome).increment(1);
    counter!(RUN_OBJECTS_TRANSFERRED, "outcome" => outcome).increment(summary.transferred as u64);
    counter!(RUN_OBJECTS_SKIPPED, "outcome" => outcome).increment(summary.skipped as u64);
    counter!(RUN_OBJECTS_FAILED, "outcome" => outcome).increment(summary.failed as u64);
    counter!(RUN_BYTES_TRANSFERRED, "outcome" => outcome).increment(summary.bytes_transferred);
    histogram!(RUN_DURATION, "outcome" => outcome)
        .record(Duration::from_millis(summary.duration_ms).as_secs_f64());
}
