//! Consumer-side writes, re-encrypted under the destination KMS key.

use crate::error::{SyncError, SyncResult, classify_sdk_error};
use crate::source::SourceObject;
use crate::types::ObjectHead;
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use tracing::debug;

/// Object metadata key holding the source fingerprint a copy was made from.
pub const SOURCE_FINGERPRINT_META: &str = "source-fingerprint";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Write access to the consumer bucket.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Returns object metadata, or `None` if the key does not exist.
    async fn head(&self, key: &str) -> SyncResult<Option<ObjectHead>>;

    /// Streams `object` into `key`, recording its source fingerprint.
    async fn put_object(&self, key: &str, object: SourceObject) -> SyncResult<()>;

    /// Reads a small document, or `None` if the key does not exist.
    async fn get_document(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    async fn put_document(&self, key: &str, body: Vec<u8>) -> SyncResult<()>;
}

/// Consumer bucket accessed with the ambient AWS credentials.
pub struct S3Destination {
    client: S3Client,
    bucket: String,
    kms_key_id: String,
}

impl S3Destination {
    pub fn new(
        sdk_config: &aws_types::SdkConfig,
        bucket: String,
        kms_key_id: String,
        endpoint_override: Option<&str>,
    ) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint_override {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: S3Client::from_conf(builder.build()),
            bucket,
            kms_key_id,
        }
    }
}

#[async_trait]
impl DestinationStore for S3Destination {
    async fn head(&self, key: &str) -> SyncResult<Option<ObjectHead>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(ObjectHead {
                size: resp
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
                source_fingerprint: resp
                    .metadata()
                    .and_then(|m| m.get(SOURCE_FINGERPRINT_META))
                    .cloned(),
            })),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(None),
            Err(e) => Err(classify_sdk_error(&format!("head object failed for {key}"), e)),
        }
    }

    async fn put_object(&self, key: &str, object: SourceObject) -> SyncResult<()> {
        let content_length = i64::try_from(object.size)
            .map_err(|_| SyncError::Storage(format!("{key} is too large: {} bytes", object.size)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(object.body)
            .content_length(content_length)
            .content_type(object.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE))
            .server_side_encryption(ServerSideEncryption::AwsKms)
            .ssekms_key_id(&self.kms_key_id)
            .metadata(SOURCE_FINGERPRINT_META, &object.fingerprint)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&format!("put object failed for {key}"), e))?;

        debug!("wrote {} bytes to s3://{}/{key}", object.size, self.bucket);
        Ok(())
    }

    async fn get_document(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => return Ok(None),
            Err(e) => return Err(classify_sdk_error(&format!("get failed for {key}"), e)),
        };

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| SyncError::TransientIo(format!("failed to read body for {key}: {e}")))?;

        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put_document(&self, key: &str, body: Vec<u8>) -> SyncResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .server_side_encryption(ServerSideEncryption::AwsKms)
            .ssekms_key_id(&self.kms_key_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&format!("put failed for {key}"), e))?;

        Ok(())
    }
}
