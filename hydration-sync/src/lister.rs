//! Paginated, restartable listing of changed source objects.

use crate::config::SyncConfig;
use crate::credentials::CredentialBroker;
use crate::error::SyncResult;
use crate::source::SourceStore;
use crate::types::{ListPage, ObjectDescriptor, SyncMarker};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Produces candidate listings against the source store.
pub struct ObjectLister {
    source: Arc<dyn SourceStore>,
    broker: Arc<CredentialBroker>,
    config: Arc<SyncConfig>,
}

impl ObjectLister {
    pub fn new(
        source: Arc<dyn SourceStore>,
        broker: Arc<CredentialBroker>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            source,
            broker,
            config,
        }
    }

    /// Filter threshold for a run: the marker minus the overlap window.
    ///
    /// The overlap keeps objects that share the marker's timestamp bucket,
    /// or were stamped by a slightly skewed producer clock, in the window.
    pub fn effective_since(
        &self,
        marker: Option<&SyncMarker>,
        force_full_sync: bool,
    ) -> Option<DateTime<Utc>> {
        if force_full_sync {
            return None;
        }
        marker.map(|m| m.watermark - self.config.overlap_window())
    }

    /// Starts a listing of objects modified strictly after `since`.
    pub fn list(&self, since: Option<DateTime<Utc>>, prefix: &str) -> Listing {
        self.listing(since, prefix, None)
    }

    /// Resumes a listing from a continuation token.
    pub fn resume(&self, since: Option<DateTime<Utc>>, prefix: &str, token: String) -> Listing {
        self.listing(since, prefix, Some(token))
    }

    fn listing(&self, since: Option<DateTime<Utc>>, prefix: &str, token: Option<String>) -> Listing {
        Listing {
            source: Arc::clone(&self.source),
            broker: Arc::clone(&self.broker),
            config: Arc::clone(&self.config),
            since,
            prefix: prefix.to_string(),
            next_token: token,
            exhausted: false,
            stats: ListingStats::default(),
        }
    }
}

/// Counters for one listing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListingStats {
    pub pages: usize,
    pub scanned: usize,
    pub admitted: usize,
    /// True once the last page has been fetched and forwarded.
    pub exhausted: bool,
}

/// A lazy, finite sequence of candidate pages.
pub struct Listing {
    source: Arc<dyn SourceStore>,
    broker: Arc<CredentialBroker>,
    config: Arc<SyncConfig>,
    since: Option<DateTime<Utc>>,
    prefix: String,
    next_token: Option<String>,
    exhausted: bool,
    stats: ListingStats,
}

impl Listing {
    /// Fetches the next page and returns its admitted candidates,
    /// or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> SyncResult<Option<Vec<ObjectDescriptor>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self.fetch_with_retry().await?;
        self.stats.pages += 1;
        self.stats.scanned += page.objects.len();
        self.next_token = page.next_token;
        self.exhausted = self.next_token.is_none();

        let candidates: Vec<_> = page
            .objects
            .into_iter()
            .filter(|d| self.admits(d))
            .collect();
        self.stats.admitted += candidates.len();

        Ok(Some(candidates))
    }

    /// Whether a listed object is a candidate for this run.
    pub fn admits(&self, descriptor: &ObjectDescriptor) -> bool {
        // Zero-byte "folder" placeholders are not objects worth copying
        if descriptor.key.ends_with('/') {
            return false;
        }
        self.since.is_none_or(|since| descriptor.last_modified > since)
    }

    /// Token to resume from after the last fetched page.
    pub fn resume_token(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn stats(&self) -> ListingStats {
        ListingStats {
            exhausted: self.exhausted,
            ..self.stats
        }
    }

    /// Drives the listing to completion, forwarding each candidate.
    ///
    /// Stops early, without error, if the receiver is dropped; the returned
    /// stats then report `exhausted: false`.
    pub async fn forward(mut self, tx: mpsc::Sender<ObjectDescriptor>) -> SyncResult<ListingStats> {
        while let Some(candidates) = self.next_page().await? {
            for descriptor in candidates {
                if tx.send(descriptor).await.is_err() {
                    debug!("candidate receiver closed, stopping listing");
                    return Ok(ListingStats {
                        exhausted: false,
                        ..self.stats
                    });
                }
            }
        }
        Ok(self.stats())
    }

    async fn fetch_with_retry(&self) -> SyncResult<ListPage> {
        let max_attempts = self.config.list_max_attempts;
        let mut attempt = 0;

        loop {
            let lease = self.broker.current().await?;
            match self
                .source
                .list_page(
                    &lease,
                    &self.prefix,
                    self.next_token.as_deref(),
                    self.config.page_size,
                )
                .await
            {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let backoff = self.config.backoff_delay(attempt);
                    warn!("listing page failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
