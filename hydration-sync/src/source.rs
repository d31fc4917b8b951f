//! Producer-side reads under the assumed-role lease.
//!
//! Every call takes the lease explicitly; an expired lease is rejected
//! before any network call is made.

use crate::error::{SyncError, SyncResult, classify_sdk_error};
use crate::types::{CredentialLease, ListPage, ObjectDescriptor};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// An open source object. The body is streamed, never buffered whole.
pub struct SourceObject {
    pub body: ByteStream,
    pub size: u64,
    /// Integrity tag of the version actually opened.
    pub fingerprint: String,
    pub content_type: Option<String>,
}

impl std::fmt::Debug for SourceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceObject")
            .field("size", &self.size)
            .field("fingerprint", &self.fingerprint)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Read access to the producer bucket.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetches one listing page, starting at `token` if given.
    async fn list_page(
        &self,
        lease: &CredentialLease,
        prefix: &str,
        token: Option<&str>,
        page_size: i32,
    ) -> SyncResult<ListPage>;

    /// Opens a read stream for `key`.
    async fn open(&self, lease: &CredentialLease, key: &str) -> SyncResult<SourceObject>;
}

/// Producer bucket accessed with STS lease credentials.
pub struct S3Source {
    bucket: String,
    region: String,
    endpoint_override: Option<String>,
    /// Client built for the most recent lease, keyed by access key id.
    client: RwLock<Option<(String, S3Client)>>,
}

impl S3Source {
    pub fn new(bucket: String, region: String, endpoint_override: Option<String>) -> Self {
        Self {
            bucket,
            region,
            endpoint_override,
            client: RwLock::new(None),
        }
    }

    async fn client_for(&self, lease: &CredentialLease) -> SyncResult<S3Client> {
        if lease.is_expired() {
            return Err(SyncError::CredentialExpired);
        }

        if let Some((key_id, client)) = self.client.read().await.as_ref() {
            if *key_id == lease.access_key_id {
                return Ok(client.clone());
            }
        }

        let client = self.build_client(lease);
        *self.client.write().await = Some((lease.access_key_id.clone(), client.clone()));
        Ok(client)
    }

    fn build_client(&self, lease: &CredentialLease) -> S3Client {
        let credentials = aws_credential_types::Credentials::new(
            &lease.access_key_id,
            &lease.secret_access_key,
            Some(lease.session_token.clone()),
            Some(lease.expires_at.into()),
            "hydration-sts-lease",
        );

        let mut config_builder = aws_sdk_s3::Config::builder()
            .region(aws_types::region::Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .behavior_version_latest();

        if let Some(ref endpoint) = self.endpoint_override {
            config_builder = config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        S3Client::from_conf(config_builder.build())
    }
}

#[async_trait]
impl SourceStore for S3Source {
    async fn list_page(
        &self,
        lease: &CredentialLease,
        prefix: &str,
        token: Option<&str>,
        page_size: i32,
    ) -> SyncResult<ListPage> {
        let client = self.client_for(lease).await?;

        let mut req = client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(page_size);
        if !prefix.is_empty() {
            req = req.prefix(prefix);
        }
        if let Some(token) = token {
            req = req.continuation_token(token);
        }

        let resp = req.send().await.map_err(|e| {
            classify_sdk_error(&format!("list failed for s3://{}/{prefix}", self.bucket), e)
        })?;

        let objects = resp
            .contents()
            .iter()
            .filter_map(descriptor_from_object)
            .collect::<Vec<_>>();

        let next_token = if resp.is_truncated().unwrap_or(false) {
            resp.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        debug!(
            "listed {} objects from s3://{}/{prefix} (more: {})",
            objects.len(),
            self.bucket,
            next_token.is_some()
        );
        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn open(&self, lease: &CredentialLease, key: &str) -> SyncResult<SourceObject> {
        let client = self.client_for(lease).await?;

        let resp = client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&format!("open failed for {key}"), e))?;

        let size = resp
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| SyncError::Storage(format!("no content length for {key}")))?;

        Ok(SourceObject {
            size,
            fingerprint: resp.e_tag().unwrap_or_default().to_string(),
            content_type: resp.content_type().map(str::to_string),
            body: resp.body,
        })
    }
}

fn descriptor_from_object(obj: &aws_sdk_s3::types::Object) -> Option<ObjectDescriptor> {
    let key = obj.key()?;
    let Some(last_modified) = obj.last_modified().and_then(to_chrono) else {
        warn!("listing entry {key} has no usable last-modified time, ignoring");
        return None;
    };

    Some(ObjectDescriptor {
        key: key.to_string(),
        size: obj.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
        last_modified,
        fingerprint: obj.e_tag().unwrap_or_default().to_string(),
    })
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}
