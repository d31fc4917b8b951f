//! Per-object transfer: idempotency check, streamed copy, post-write verification.

use crate::config::SyncConfig;
use crate::credentials::CredentialBroker;
use crate::destination::DestinationStore;
use crate::error::{SyncError, SyncResult};
use crate::source::SourceStore;
use crate::types::{CredentialLease, ObjectDescriptor, TransferOutcome};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Moves a single object from source to destination.
///
/// Workers share nothing mutable; the outcome is the only thing they produce.
pub struct TransferWorker {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    broker: Arc<CredentialBroker>,
    config: Arc<SyncConfig>,
    dry_run: bool,
}

impl TransferWorker {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        broker: Arc<CredentialBroker>,
        config: Arc<SyncConfig>,
        dry_run: bool,
    ) -> Self {
        Self {
            source,
            destination,
            broker,
            config,
            dry_run,
        }
    }

    /// Transfers `descriptor`, retrying transient failures with backoff.
    ///
    /// Never returns an error: every failure is classified into the outcome.
    pub async fn transfer(
        &self,
        descriptor: &ObjectDescriptor,
        lease: &CredentialLease,
    ) -> TransferOutcome {
        let max_attempts = self.config.object_max_attempts;
        let mut attempt = 0;

        loop {
            match self.attempt(descriptor, lease).await {
                Ok(outcome) => return outcome,
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let backoff = self.config.backoff_delay(attempt);
                    warn!(
                        "transfer of {} failed (attempt {}/{max_attempts}), retrying in {backoff:?}: {e}",
                        descriptor.key,
                        attempt + 1
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "transfer of {} failed after {} attempt(s): {e}",
                        descriptor.key,
                        attempt + 1
                    );
                    return TransferOutcome::failed(descriptor, e.kind());
                }
            }
        }
    }

    async fn attempt(
        &self,
        descriptor: &ObjectDescriptor,
        lease: &CredentialLease,
    ) -> SyncResult<TransferOutcome> {
        let key = &descriptor.key;

        if let Some(head) = self.destination.head(key).await? {
            if head.matches(descriptor.size, &descriptor.fingerprint) {
                debug!("{key} already present with matching fingerprint, skipping");
                return Ok(TransferOutcome::skipped(descriptor));
            }
        }

        if self.dry_run {
            info!("dry run: would transfer {key} ({} bytes)", descriptor.size);
            return Ok(TransferOutcome::transferred(descriptor, 0));
        }

        let lease = self.broker.ensure_fresh(lease).await?;
        let object = match self.source.open(&lease, key).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                debug!("{key} vanished from source after listing, skipping");
                return Ok(TransferOutcome::skipped(descriptor));
            }
            Err(e) => return Err(e),
        };

        let size = object.size;
        let fingerprint = object.fingerprint.clone();
        self.destination.put_object(key, object).await?;
        self.verify(key, size, &fingerprint).await?;

        info!("transferred {key} ({size} bytes)");
        Ok(TransferOutcome::transferred(descriptor, size))
    }

    /// Confirms the destination holds exactly what was streamed.
    async fn verify(&self, key: &str, size: u64, fingerprint: &str) -> SyncResult<()> {
        match self.destination.head(key).await? {
            Some(head) if head.matches(size, fingerprint) => Ok(()),
            Some(head) => Err(SyncError::Integrity(format!(
                "{key}: streamed {size} bytes ({fingerprint}), destination reports {} bytes ({})",
                head.size,
                head.source_fingerprint.as_deref().unwrap_or("no fingerprint")
            ))),
            None => Err(SyncError::Integrity(format!(
                "{key}: object missing after write"
            ))),
        }
    }
}
