//! Sync run orchestration.
//!
//! One run:
//! - acquires the producer lease
//! - loads the prior marker
//! - streams candidates from the lister into a bounded worker pool
//! - stops admitting work once the deadline leaves no room for another object
//! - drains in-flight transfers, computes the next marker and persists it
//!
//! Listing and transferring are pipelined: workers start on the first page
//! while later pages are still being fetched.

use crate::checkpoint::CheckpointCalculator;
use crate::config::{SyncConfig, TriggerPayload};
use crate::credentials::{CredentialBroker, CredentialExchange, StsExchange};
use crate::destination::{DestinationStore, S3Destination};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::lister::ObjectLister;
use crate::marker::MarkerStore;
use crate::report::{RunAggregator, publish_run};
use crate::source::{S3Source, SourceStore};
use crate::transfer::TransferWorker;
use crate::types::{ObjectDescriptor, RunSummary, TransferOutcome};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

/// Incremental sync engine for one source and one destination.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    broker: Arc<CredentialBroker>,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    markers: MarkerStore,
    checkpoint: CheckpointCalculator,
}

impl SyncEngine {
    pub fn new(
        config: Arc<SyncConfig>,
        exchange: Arc<dyn CredentialExchange>,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            broker: Arc::new(CredentialBroker::new(exchange, Arc::clone(&config))),
            markers: MarkerStore::new(Arc::clone(&destination), config.marker_key.clone()),
            checkpoint: CheckpointCalculator::new(&config),
            config,
            source,
            destination,
        }
    }

    /// Wires the production S3 and STS collaborators from the ambient AWS environment.
    pub async fn connect(config: Arc<SyncConfig>) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_types::region::Region::new(config.region.clone()))
            .load()
            .await;
        let endpoint = config.endpoint_override.as_deref();

        let exchange = Arc::new(StsExchange::new(&sdk_config, endpoint));
        let source = Arc::new(S3Source::new(
            config.source_bucket.clone(),
            config.region.clone(),
            config.endpoint_override.clone(),
        ));
        let destination = Arc::new(S3Destination::new(
            &sdk_config,
            config.destination_bucket.clone(),
            config.destination_kms_key_id.clone(),
            endpoint,
        ));

        Self::new(config, exchange, source, destination)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs with the configured wall-clock budget.
    pub async fn run(&self, trigger: &TriggerPayload) -> SyncResult<RunSummary> {
        self.run_until(trigger, Instant::now() + self.config.run_budget())
            .await
    }

    /// Runs until `deadline`, draining gracefully before it.
    ///
    /// Object-level failures are reported in the summary. Only run-level
    /// faults (credentials, marker, listing) return an error, and those
    /// leave the marker untouched.
    pub async fn run_until(
        &self,
        trigger: &TriggerPayload,
        deadline: Instant,
    ) -> SyncResult<RunSummary> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let prefix = trigger.effective_prefix(&self.config).to_string();

        info!(
            "sync run starting: s3://{}/{prefix} -> s3://{} (full: {}, dry run: {})",
            self.config.source_bucket,
            self.config.destination_bucket,
            trigger.force_full_sync,
            trigger.dry_run
        );

        let lease = self.broker.acquire().await.inspect_err(|e| {
            error!("unable to acquire source credentials: {e}");
        })?;
        let prior = self.markers.load().await.inspect_err(|e| {
            error!("unable to load sync marker: {e}");
        })?;

        let lister = ObjectLister::new(
            Arc::clone(&self.source),
            Arc::clone(&self.broker),
            Arc::clone(&self.config),
        );
        let since = lister.effective_since(prior.as_ref(), trigger.force_full_sync);
        match since {
            Some(since) => info!("listing objects modified after {since}"),
            None => info!("listing all objects (full sync)"),
        }

        // One page of look-ahead between the lister and the pool
        let (tx, mut rx) = mpsc::channel(self.config.page_size.max(1) as usize);
        let list_task = tokio::spawn(lister.list(since, &prefix).forward(tx));

        let aggregator = Arc::new(RunAggregator::new());
        let worker = Arc::new(TransferWorker::new(
            Arc::clone(&self.source),
            Arc::clone(&self.destination),
            Arc::clone(&self.broker),
            Arc::clone(&self.config),
            trigger.dry_run,
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, ObjectDescriptor> = HashMap::new();
        let mut considered: Vec<ObjectDescriptor> = Vec::new();

        let admission_cutoff = deadline
            .checked_sub(self.config.worst_case_object_time())
            .unwrap_or(clock);
        let mut time_boxed = false;

        loop {
            let descriptor = match timeout_at(admission_cutoff, rx.recv()).await {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => break,
                Err(_) => {
                    time_boxed = true;
                    break;
                }
            };
            considered.push(descriptor.clone());

            let permit =
                match timeout_at(admission_cutoff, Arc::clone(&semaphore).acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => break,
                    Err(_) => {
                        time_boxed = true;
                        break;
                    }
                };

            let worker = Arc::clone(&worker);
            let task_aggregator = Arc::clone(&aggregator);
            let lease = lease.clone();
            let task_descriptor = descriptor.clone();
            let handle = tasks.spawn(async move {
                let outcome = worker.transfer(&task_descriptor, &lease).await;
                task_aggregator.record(outcome);
                drop(permit);
            });
            in_flight.insert(handle.id(), descriptor);

            while let Some(joined) = tasks.try_join_next_with_id() {
                reap(joined, &mut in_flight, &aggregator);
            }
        }

        let mut listing_error = None;
        let listing_complete = if time_boxed {
            warn!("run budget nearly exhausted, no longer admitting new objects");
            rx.close();
            while let Ok(descriptor) = rx.try_recv() {
                considered.push(descriptor);
            }
            list_task.abort();
            match list_task.await {
                Ok(Ok(stats)) => stats.exhausted,
                Ok(Err(e)) => {
                    warn!("listing failed while draining: {e}");
                    false
                }
                Err(_) => false,
            }
        } else {
            match list_task.await {
                Ok(Ok(stats)) => {
                    debug!(
                        "listing finished: {} pages, {} scanned, {} candidates",
                        stats.pages, stats.scanned, stats.admitted
                    );
                    stats.exhausted
                }
                Ok(Err(e)) => {
                    listing_error = Some(e);
                    false
                }
                Err(e) => {
                    listing_error = Some(SyncError::Internal(format!("listing task failed: {e}")));
                    false
                }
            }
        };

        // Graceful drain: in-flight transfers are never cancelled mid-write
        while let Some(joined) = tasks.join_next_with_id().await {
            reap(joined, &mut in_flight, &aggregator);
        }

        if let Some(e) = listing_error {
            error!("listing failed, marker left unchanged: {e}");
            return Err(e);
        }

        let outcomes = aggregator.outcomes();
        let next_marker = self.checkpoint.next_marker(
            prior.as_ref(),
            &considered,
            &outcomes,
            started_at,
            listing_complete,
        );

        match (&next_marker, trigger.dry_run) {
            (Some(marker), false) if prior.as_ref() != Some(marker) => {
                self.markers.save(marker).await.inspect_err(|e| {
                    error!("unable to persist sync marker: {e}");
                })?;
            }
            (Some(marker), true) => {
                info!("dry run: marker would advance to {}", marker.watermark)
            }
            (Some(_), false) => debug!("marker unchanged"),
            (None, _) => warn!("listing incomplete on a first run, no marker written"),
        }

        let summary = aggregator.summarize(
            next_marker.map(|m| m.watermark),
            time_boxed,
            trigger.dry_run,
            clock.elapsed(),
        );
        publish_run(&summary);

        info!(
            "sync run finished: {} transferred, {} skipped, {} failed, {} of {} candidates attempted, {} bytes in {}ms{}",
            summary.transferred,
            summary.skipped,
            summary.failed,
            outcomes.len(),
            considered.len(),
            summary.bytes_transferred,
            summary.duration_ms,
            if summary.time_boxed { " (time-boxed)" } else { "" }
        );

        Ok(summary)
    }
}

/// Clears a finished task; a panicked worker's object is recorded as failed.
fn reap(
    joined: Result<(tokio::task::Id, ()), JoinError>,
    in_flight: &mut HashMap<tokio::task::Id, ObjectDescriptor>,
    aggregator: &RunAggregator,
) {
    match joined {
        Ok((id, ())) => {
            in_flight.remove(&id);
        }
        Err(e) => {
            if let Some(descriptor) = in_flight.remove(&e.id()) {
                error!("transfer task for {} aborted: {e}", descriptor.key);
                aggregator.record(TransferOutcome::failed(&descriptor, ErrorKind::Internal));
            }
        }
    }
}
