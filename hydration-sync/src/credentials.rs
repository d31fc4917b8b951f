//! STS lease brokering with refresh before expiry.
//!
//! The broker is the single owner of the producer-side lease. Workers only
//! ever see clones of it and ask the broker for a fresh one before each use.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, classify_sdk_error};
use crate::types::CredentialLease;
use async_trait::async_trait;
use aws_sdk_sts::types::Tag;
use chrono::DateTime;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Session tag carrying the organisation scope on the assumed role.
pub const ORG_SCOPE_TAG: &str = "OrgScope";

/// Everything needed to trade the trust relationship for a lease.
#[derive(Clone, Debug)]
pub struct LeaseRequest {
    pub role_arn: String,
    pub external_id: String,
    pub org_scope_id: String,
    pub session_name: String,
    pub duration_secs: i32,
}

impl LeaseRequest {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            role_arn: config.trust_role_arn.clone(),
            external_id: config.external_id.clone(),
            org_scope_id: config.org_scope_id.clone(),
            session_name: config.session_name.clone(),
            duration_secs: config.lease_duration_secs,
        }
    }
}

/// One credential exchange against the trust boundary.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self, request: &LeaseRequest) -> SyncResult<CredentialLease>;
}

/// Exchanges the trust relationship via STS `AssumeRole`.
pub struct StsExchange {
    client: aws_sdk_sts::Client,
}

impl StsExchange {
    pub fn new(sdk_config: &aws_types::SdkConfig, endpoint_override: Option<&str>) -> Self {
        let mut builder = aws_sdk_sts::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint_override {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: aws_sdk_sts::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl CredentialExchange for StsExchange {
    async fn exchange(&self, request: &LeaseRequest) -> SyncResult<CredentialLease> {
        let org_tag = Tag::builder()
            .key(ORG_SCOPE_TAG)
            .value(&request.org_scope_id)
            .build()
            .map_err(|e| SyncError::Config(format!("invalid organisation scope tag: {e}")))?;

        let resp = self
            .client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .external_id(&request.external_id)
            .duration_seconds(request.duration_secs)
            .tags(org_tag)
            .send()
            .await
            .map_err(|e| {
                classify_sdk_error(&format!("assume role {} failed", request.role_arn), e)
            })?;

        let creds = resp
            .credentials()
            .ok_or_else(|| SyncError::Auth("assume role returned no credentials".into()))?;

        let expiration = creds.expiration();
        let expires_at = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| SyncError::Auth(format!("lease expiry out of range: {expiration:?}")))?;

        Ok(CredentialLease {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expires_at,
        })
    }
}

/// Owns the producer lease and refreshes it before expiry.
pub struct CredentialBroker {
    exchange: Arc<dyn CredentialExchange>,
    request: LeaseRequest,
    config: Arc<SyncConfig>,
    lease: RwLock<Option<CredentialLease>>,
    /// Serializes exchanges so concurrent workers trigger at most one refresh.
    refresh_lock: Mutex<()>,
}

impl CredentialBroker {
    pub fn new(exchange: Arc<dyn CredentialExchange>, config: Arc<SyncConfig>) -> Self {
        Self {
            exchange,
            request: LeaseRequest::from_config(&config),
            config,
            lease: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Exchanges the trust relationship for a new lease.
    ///
    /// Failure here is fatal for the run: it almost always means a wrong role,
    /// external id or organisation scope, so only a few attempts are made.
    pub async fn acquire(&self) -> SyncResult<CredentialLease> {
        let _guard = self.refresh_lock.lock().await;
        self.exchange_with_retry().await
    }

    /// Returns `lease` if it is outside the refresh margin, else a fresh one.
    pub async fn ensure_fresh(&self, lease: &CredentialLease) -> SyncResult<CredentialLease> {
        if !lease.expires_within_secs(self.config.credential_refresh_margin_secs) {
            return Ok(lease.clone());
        }
        debug!(
            "lease expiring within {}s, refreshing",
            self.config.credential_refresh_margin_secs
        );
        self.current().await
    }

    /// Returns the cached lease, refreshing it if needed.
    pub async fn current(&self) -> SyncResult<CredentialLease> {
        let margin = self.config.credential_refresh_margin_secs;

        // Fast path: cached lease still outside the margin
        if let Some(lease) = self.cached_fresh(margin).await {
            return Ok(lease);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(lease) = self.cached_fresh(margin).await {
            return Ok(lease);
        }

        self.exchange_with_retry().await
    }

    /// Returns true if a lease is cached and outside the refresh margin.
    pub async fn has_valid_lease(&self) -> bool {
        self.cached_fresh(self.config.credential_refresh_margin_secs)
            .await
            .is_some()
    }

    async fn cached_fresh(&self, margin: i64) -> Option<CredentialLease> {
        let lease = self.lease.read().await;
        lease
            .as_ref()
            .filter(|l| !l.expires_within_secs(margin))
            .cloned()
    }

    async fn exchange_with_retry(&self) -> SyncResult<CredentialLease> {
        let max_attempts = self.config.credential_max_attempts;
        let mut attempt = 0;

        let lease = loop {
            match self.exchange.exchange(&self.request).await {
                Ok(lease) => break lease,
                Err(e) if !matches!(e, SyncError::Config(_)) && attempt + 1 < max_attempts => {
                    let backoff = self.config.backoff_delay(attempt);
                    warn!(
                        "credential exchange failed (attempt {}/{max_attempts}), retrying in {backoff:?}: {e}",
                        attempt + 1
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("credential exchange failed after {} attempt(s): {e}", attempt + 1);
                    return Err(e);
                }
            }
        };

        if lease.is_expired() {
            return Err(SyncError::Auth(format!("exchange returned an expired {lease}")));
        }

        info!("acquired {lease} for role {}", self.request.role_arn);
        *self.lease.write().await = Some(lease.clone());
        Ok(lease)
    }
}
