//! Sync error types and AWS error classification.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_runtime_api::client::result::SdkError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage request rejected: {0}")]
    Storage(String),

    #[error("STS lease expired")]
    CredentialExpired,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error category reported per failed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Auth,
    NotFound,
    TransientIo,
    Integrity,
    Configuration,
    Storage,
    Internal,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) | SyncError::CredentialExpired => ErrorKind::Auth,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::TransientIo(_) => ErrorKind::TransientIo,
            SyncError::Integrity(_) => ErrorKind::Integrity,
            SyncError::Config(_) | SyncError::Serialization(_) => ErrorKind::Configuration,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only network, throttling and 5xx-class failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientIo(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "ExpiredToken",
    "InvalidAccessKeyId",
    "InvalidClientTokenId",
    "InvalidToken",
    "SignatureDoesNotMatch",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound"];

const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "InternalError",
    "ServiceUnavailable",
];

/// Maps an HTTP status and service error code onto the sync taxonomy.
///
/// The error code wins over the status: S3 reports throttling as 503 `SlowDown`
/// but STS reports it as 400 `Throttling`.
pub fn classify_response(status: Option<u16>, code: Option<&str>, detail: String) -> SyncError {
    if let Some(code) = code {
        if AUTH_CODES.contains(&code) {
            return SyncError::Auth(detail);
        }
        if NOT_FOUND_CODES.contains(&code) {
            return SyncError::NotFound(detail);
        }
        if TRANSIENT_CODES.contains(&code) {
            return SyncError::TransientIo(detail);
        }
    }

    match status {
        Some(401 | 403) => SyncError::Auth(detail),
        Some(404) => SyncError::NotFound(detail),
        Some(408 | 429) => SyncError::TransientIo(detail),
        Some(s) if s >= 500 => SyncError::TransientIo(detail),
        _ => SyncError::Storage(detail),
    }
}

/// Classifies an SDK error from either the S3 or the STS client.
pub(crate) fn classify_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> SyncError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{context}: {}", DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            SyncError::TransientIo(detail)
        }
        SdkError::ConstructionFailure(_) => SyncError::Storage(detail),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            let code = err.as_service_error().and_then(|e| e.code());
            classify_response(status, code, detail)
        }
    }
}
