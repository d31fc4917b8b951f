//! Shared types for sync runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::error::ErrorKind;

/// Temporary, read-only STS credentials for the producer bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialLease {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialLease {
    /// Returns true if the lease will expire within the given seconds.
    pub fn expires_within_secs(&self, secs: i64) -> bool {
        Utc::now() + chrono::Duration::seconds(secs) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

// Secrets stay out of logs.
impl std::fmt::Display for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease {} (expires {})", self.access_key_id, self.expires_at)
    }
}

/// High-water mark persisted in the destination bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMarker {
    pub watermark: DateTime<Utc>,
    pub schema_version: u32,
}

impl SyncMarker {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn new(watermark: DateTime<Utc>) -> Self {
        Self {
            watermark,
            schema_version: Self::SCHEMA_VERSION,
        }
    }
}

/// A candidate object in the producer bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Integrity tag reported by the source (the S3 ETag).
    pub fingerprint: String,
}

/// Destination-side metadata used for the idempotency check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    /// Source fingerprint recorded when the object was written, if any.
    pub source_fingerprint: Option<String>,
}

impl ObjectHead {
    /// True when the destination already holds exactly this source version.
    pub fn matches(&self, size: u64, fingerprint: &str) -> bool {
        self.size == size && self.source_fingerprint.as_deref() == Some(fingerprint)
    }
}

/// One page of a source listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectDescriptor>,
    /// Continuation token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Terminal state of a single object attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Transferred,
    Skipped,
    Failed,
}

/// Result of attempting one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub key: String,
    pub status: TransferStatus,
    pub error: Option<ErrorKind>,
    pub source_last_modified: DateTime<Utc>,
    pub bytes: u64,
}

impl TransferOutcome {
    pub fn transferred(descriptor: &ObjectDescriptor, bytes: u64) -> Self {
        Self {
            key: descriptor.key.clone(),
            status: TransferStatus::Transferred,
            error: None,
            source_last_modified: descriptor.last_modified,
            bytes,
        }
    }

    pub fn skipped(descriptor: &ObjectDescriptor) -> Self {
        Self {
            key: descriptor.key.clone(),
            status: TransferStatus::Skipped,
            error: None,
            source_last_modified: descriptor.last_modified,
            bytes: 0,
        }
    }

    pub fn failed(descriptor: &ObjectDescriptor, kind: ErrorKind) -> Self {
        Self {
            key: descriptor.key.clone(),
            status: TransferStatus::Failed,
            error: Some(kind),
            source_last_modified: descriptor.last_modified,
            bytes: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TransferStatus::Failed
    }
}

/// A failed object as reported in the run output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedObject {
    pub key: String,
    pub kind: ErrorKind,
}

/// How a run ended, used to label run-level metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every candidate was transferred or skipped.
    Complete,
    /// Listing finished but some objects failed.
    Partial,
    /// The deadline stopped admission before all candidates were attempted.
    TimeBoxed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Complete => "complete",
            RunOutcome::Partial => "partial",
            RunOutcome::TimeBoxed => "time_boxed",
        }
    }
}

/// Result of a whole run, returned to the invoking scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub next_marker: Option<DateTime<Utc>>,
    pub time_boxed: bool,
    pub dry_run: bool,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub errors: Vec<FailedObject>,
}

impl RunSummary {
    pub fn outcome(&self) -> RunOutcome {
        if self.time_boxed {
            RunOutcome::TimeBoxed
        } else if self.failed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Complete
        }
    }
}
