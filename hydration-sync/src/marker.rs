//! Durable sync marker stored in the destination bucket.
//!
//! The marker is a small JSON document at a well-known key:
//! `{ "watermark": "<RFC 3339>", "schemaVersion": 1 }`.

use crate::destination::DestinationStore;
use crate::error::{SyncError, SyncResult};
use crate::types::SyncMarker;
use std::sync::Arc;
use tracing::{debug, info};

pub struct MarkerStore {
    destination: Arc<dyn DestinationStore>,
    key: String,
}

impl MarkerStore {
    pub fn new(destination: Arc<dyn DestinationStore>, key: String) -> Self {
        Self { destination, key }
    }

    /// Reads the prior marker. `None` means no run has completed yet.
    ///
    /// A malformed document or an unknown schema version is a configuration
    /// error: guessing a watermark could silently skip objects.
    pub async fn load(&self) -> SyncResult<Option<SyncMarker>> {
        let Some(bytes) = self.destination.get_document(&self.key).await? else {
            debug!("no marker at {}, starting a full sync", self.key);
            return Ok(None);
        };

        let marker: SyncMarker = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Config(format!("malformed marker at {}: {e}", self.key)))?;

        if marker.schema_version != SyncMarker::SCHEMA_VERSION {
            return Err(SyncError::Config(format!(
                "marker at {} has schema version {}, expected {}",
                self.key,
                marker.schema_version,
                SyncMarker::SCHEMA_VERSION
            )));
        }

        debug!("loaded marker {} from {}", marker.watermark, self.key);
        Ok(Some(marker))
    }

    pub async fn save(&self, marker: &SyncMarker) -> SyncResult<()> {
        let body = serde_json::to_vec(marker)?;
        self.destination.put_document(&self.key, body).await?;
        info!("marker at {} advanced to {}", self.key, marker.watermark);
        Ok(())
    }
}
