//! Incremental cross-account S3 sync engine.
//!
//! Pulls objects from a producer bucket into a consumer bucket with:
//! - STS lease brokering with refresh before expiry
//! - Marker-based change detection with an overlap window
//! - Bounded-concurrency streamed transfers re-encrypted under the consumer KMS key
//! - Idempotent skips keyed on the source fingerprint
//! - Checkpoints that never advance past failed or unattempted objects
//! - A wall-clock budget with graceful drain

pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod destination;
pub mod engine;
pub mod error;
pub mod lister;
pub mod marker;
pub mod report;
pub mod source;
pub mod transfer;
pub mod types;

pub use config::{SyncConfig, TriggerPayload};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use types::*;
