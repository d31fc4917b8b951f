//! Next-marker computation that is safe under partial failure.
//!
//! The watermark never moves past an object that failed or was never
//! attempted, so every such object stays inside the next run's window.

use crate::config::SyncConfig;
use crate::types::{ObjectDescriptor, SyncMarker, TransferOutcome};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug)]
pub struct CheckpointCalculator {
    overlap: chrono::Duration,
    resolution: chrono::Duration,
}

impl CheckpointCalculator {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            overlap: config.overlap_window(),
            resolution: config.timestamp_resolution(),
        }
    }

    /// Computes the marker to persist at the end of a run.
    ///
    /// - Every listed candidate settled (transferred or skipped): the run's
    ///   start time minus the overlap window.
    /// - Otherwise: the oldest failed or unattempted candidate's
    ///   `last_modified`, minus one unit of timestamp resolution, and
    ///   never later than the all-settled value.
    ///
    /// When the listing did not finish, objects that were never listed are
    /// unknown, so the result is additionally capped at the prior marker.
    /// Without a prior marker there is nothing safe to write and `None` is
    /// returned, leaving the next run a full sync.
    pub fn next_marker(
        &self,
        prior: Option<&SyncMarker>,
        considered: &[ObjectDescriptor],
        outcomes: &[TransferOutcome],
        run_started_at: DateTime<Utc>,
        listing_complete: bool,
    ) -> Option<SyncMarker> {
        let settled: HashSet<&str> = outcomes
            .iter()
            .filter(|o| !o.is_failed())
            .map(|o| o.key.as_str())
            .collect();

        let oldest_unattempted = considered
            .iter()
            .filter(|d| !settled.contains(d.key.as_str()))
            .map(|d| d.last_modified)
            .min();

        let oldest_failed = outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(|o| o.source_last_modified)
            .min();

        let oldest_unsettled = match (oldest_unattempted, oldest_failed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        // Never past the run start: objects rewritten mid-run under keys
        // already listed must stay inside the next window
        let ceiling = run_started_at - self.overlap;
        let mut watermark = match oldest_unsettled {
            Some(oldest) => (oldest - self.resolution).min(ceiling),
            None => ceiling,
        };

        if !listing_complete {
            watermark = watermark.min(prior?.watermark);
        }

        Some(SyncMarker::new(watermark))
    }
}
