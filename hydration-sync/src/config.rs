//! Run configuration and trigger payload.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable configuration for a sync run.
///
/// Built once at invocation start and shared by reference with every
/// component; nothing reads the environment after this point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Producer bucket read under the assumed role.
    pub source_bucket: String,

    /// Consumer bucket written with the ambient credentials.
    pub destination_bucket: String,

    /// Role in the producer account granting read-only access.
    pub trust_role_arn: String,

    /// Confused-deputy secret required by the role's trust policy.
    pub external_id: String,

    /// Organisation identifier passed as a session tag on the assumed role.
    pub org_scope_id: String,

    /// KMS key that destination objects are encrypted under.
    pub destination_kms_key_id: String,

    pub region: String,

    /// Optional S3/STS endpoint override (for MinIO in testing).
    pub endpoint_override: Option<String>,

    /// Only keys under this prefix are considered. Empty means all keys.
    pub key_prefix: String,

    /// Well-known key of the marker document in the destination bucket.
    pub marker_key: String,

    pub session_name: String,

    /// Maximum transfers in flight.
    pub concurrency: usize,

    /// Keys requested per listing page.
    pub page_size: i32,

    /// Backward adjustment applied to the watermark before filtering.
    pub overlap_window_secs: i64,

    /// Granularity of source timestamps.
    pub timestamp_resolution_ms: i64,

    /// Requested lifetime of the assumed-role session.
    pub lease_duration_secs: i32,

    /// Refresh the lease once its remaining lifetime drops below this.
    pub credential_refresh_margin_secs: i64,

    pub credential_max_attempts: u32,

    /// Attempts per listing page. A page that keeps failing aborts the run.
    pub list_max_attempts: u32,

    pub object_max_attempts: u32,

    /// First backoff delay; doubles on each retry.
    pub retry_base_delay_ms: u64,

    /// Estimated worst-case time to transfer one object. Admission stops
    /// once less than this remains before the deadline.
    pub worst_case_object_secs: u64,

    /// Default wall-clock budget for a run.
    pub run_budget_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_bucket: String::new(),
            destination_bucket: String::new(),
            trust_role_arn: String::new(),
            external_id: String::new(),
            org_scope_id: String::new(),
            destination_kms_key_id: String::new(),
            region: "us-east-1".to_string(),
            endpoint_override: None,
            key_prefix: String::new(),
            marker_key: "_s3_hydration_last_sync".to_string(),
            session_name: "s3-hydration-consumer".to_string(),
            concurrency: 8,
            page_size: 1000,
            overlap_window_secs: 5,
            timestamp_resolution_ms: 1000,
            lease_duration_secs: 3600,
            credential_refresh_margin_secs: 300, // 5 minutes before expiry
            credential_max_attempts: 3,
            list_max_attempts: 3,
            object_max_attempts: 3,
            retry_base_delay_ms: 200,
            worst_case_object_secs: 60,
            run_budget_secs: 840, // 14 minutes
        }
    }
}

impl SyncConfig {
    /// Loads configuration from process environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &str| {
            var(name).ok_or_else(|| {
                SyncError::Config(format!("missing required environment variable: {name}"))
            })
        };

        let mut config = Self {
            source_bucket: require("SOURCE_BUCKET")?,
            destination_bucket: require("DESTINATION_BUCKET")?,
            trust_role_arn: require("TRUST_ROLE_ARN")?,
            external_id: require("EXTERNAL_ID")?,
            org_scope_id: require("ORG_SCOPE_ID")?,
            destination_kms_key_id: require("DESTINATION_KMS_KEY_ID")?,
            endpoint_override: var("S3_ENDPOINT_OVERRIDE"),
            ..Self::default()
        };

        if let Some(region) = var("AWS_REGION") {
            config.region = region;
        }
        if let Some(prefix) = var("TRANSFER_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(marker_key) = var("MARKER_KEY") {
            config.marker_key = marker_key;
        }
        if let Some(v) = var("SYNC_CONCURRENCY") {
            config.concurrency = parse_var("SYNC_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("OVERLAP_WINDOW_SECS") {
            config.overlap_window_secs = parse_var("OVERLAP_WINDOW_SECS", &v)?;
        }
        if let Some(v) = var("WORST_CASE_OBJECT_SECS") {
            config.worst_case_object_secs = parse_var("WORST_CASE_OBJECT_SECS", &v)?;
        }
        if let Some(v) = var("RUN_BUDGET_SECS") {
            config.run_budget_secs = parse_var("RUN_BUDGET_SECS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations that would make a run unsafe or impossible.
    pub fn validate(&self) -> SyncResult<()> {
        if self.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".into()));
        }
        if self.page_size <= 0 {
            return Err(SyncError::Config("page_size must be positive".into()));
        }
        if self.credential_max_attempts == 0
            || self.list_max_attempts == 0
            || self.object_max_attempts == 0
        {
            return Err(SyncError::Config("retry attempts must be at least 1".into()));
        }
        if self.overlap_window_secs < 0 || self.timestamp_resolution_ms <= 0 {
            return Err(SyncError::Config(
                "overlap window must be non-negative and timestamp resolution positive".into(),
            ));
        }
        if self.credential_refresh_margin_secs >= i64::from(self.lease_duration_secs) {
            return Err(SyncError::Config(format!(
                "refresh margin {}s must be shorter than lease duration {}s",
                self.credential_refresh_margin_secs, self.lease_duration_secs
            )));
        }
        if self.worst_case_object_secs >= self.run_budget_secs {
            return Err(SyncError::Config(format!(
                "worst-case object time {}s leaves no room in a {}s budget",
                self.worst_case_object_secs, self.run_budget_secs
            )));
        }
        Ok(())
    }

    pub fn overlap_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.overlap_window_secs)
    }

    pub fn timestamp_resolution(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.timestamp_resolution_ms)
    }

    pub fn worst_case_object_time(&self) -> Duration {
        Duration::from_secs(self.worst_case_object_secs)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }

    /// Exponential backoff before retry number `attempt` (zero-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> SyncResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid value for {name}: {value:?}")))
}

/// Structured input supplied by the scheduler for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct TriggerPayload {
    /// Ignore the marker and consider every object.
    pub force_full_sync: bool,

    /// Restricts this run to keys under the prefix.
    pub key_prefix: Option<String>,

    /// Report what would happen without writing objects or the marker.
    pub dry_run: bool,
}

impl TriggerPayload {
    /// Parses a trigger payload. An absent or blank payload means all defaults.
    pub fn parse(raw: Option<&str>) -> SyncResult<Self> {
        match raw.map(str::trim) {
            None | Some("") | Some("null") => Ok(Self::default()),
            Some(json) => serde_json::from_str(json)
                .map_err(|e| SyncError::Config(format!("invalid trigger payload: {e}"))),
        }
    }

    /// Prefix for this run: the trigger's, if non-empty, else the configured one.
    pub fn effective_prefix<'a>(&'a self, config: &'a SyncConfig) -> &'a str {
        match self.key_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => &config.key_prefix,
        }
    }
}
