//! Shared in-memory doubles for integration tests.
//!
//! `MemorySource` and `MemoryDestination` behave like a bucket with
//! lexicographic listing, and expose fault injection plus instrumentation
//! (call counts, peak concurrent writes) for assertions.

#![allow(dead_code)]

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hydration_sync::credentials::{CredentialExchange, LeaseRequest};
use hydration_sync::destination::DestinationStore;
use hydration_sync::source::{SourceObject, SourceStore};
use hydration_sync::{
    CredentialLease, ListPage, ObjectDescriptor, ObjectHead, SyncConfig, SyncEngine, SyncError,
    SyncResult,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fixed epoch all synthetic timestamps are offset from.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        source_bucket: "producer-bucket".into(),
        destination_bucket: "consumer-bucket".into(),
        trust_role_arn: "arn:aws:iam::111111111111:role/hydration-read".into(),
        external_id: "deputy-secret".into(),
        org_scope_id: "o-example".into(),
        destination_kms_key_id: "alias/consumer".into(),
        concurrency: 4,
        retry_base_delay_ms: 1,
        ..SyncConfig::default()
    }
}

pub fn fingerprint_of(body: &[u8]) -> String {
    // FNV-1a, enough to tell test payloads apart
    let hash = body.iter().fold(0xcbf29ce484222325u64, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    });
    format!("\"{hash:016x}\"")
}

pub fn descriptor(key: &str, body: &[u8], last_modified: DateTime<Utc>) -> ObjectDescriptor {
    ObjectDescriptor {
        key: key.to_string(),
        size: body.len() as u64,
        last_modified,
        fingerprint: fingerprint_of(body),
    }
}

pub fn lease(expires_in_secs: i64) -> CredentialLease {
    CredentialLease {
        access_key_id: "ASIATEST".to_string(),
        secret_access_key: "secret".to_string(),
        session_token: "token".to_string(),
        expires_at: Utc::now() + Duration::seconds(expires_in_secs),
    }
}

// ── Credential exchange ─────────────────────────────────────────

pub struct StaticExchange {
    lifetime: Duration,
    calls: AtomicUsize,
    failures_remaining: AtomicUsize,
    transient: bool,
}

impl StaticExchange {
    pub fn new() -> Self {
        Self::with_lifetime(Duration::hours(1))
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            lifetime,
            calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            transient: false,
        }
    }

    /// Rejects the first `n` exchanges with `AccessDenied`.
    pub fn denying(n: usize) -> Self {
        let exchange = Self::new();
        exchange.failures_remaining.store(n, Ordering::SeqCst);
        exchange
    }

    /// Fails the first `n` exchanges with a network error.
    pub fn flaky(n: usize) -> Self {
        Self {
            transient: true,
            ..Self::denying(n)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchange for StaticExchange {
    async fn exchange(&self, request: &LeaseRequest) -> SyncResult<CredentialLease> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.transient {
                SyncError::TransientIo("dispatch failure".into())
            } else {
                SyncError::Auth(format!("AccessDenied for {}", request.role_arn))
            });
        }

        Ok(CredentialLease {
            access_key_id: format!("ASIA{n:04}"),
            secret_access_key: "secret".into(),
            session_token: format!("session-{n}"),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}

// ── Source ──────────────────────────────────────────────────────

#[derive(Clone)]
struct SourceEntry {
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemorySource {
    objects: Mutex<BTreeMap<String, SourceEntry>>,
    vanished: Mutex<HashSet<String>>,
    transient_list_failures: AtomicUsize,
    reject_lists: AtomicBool,
    list_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, body: &[u8], last_modified: DateTime<Utc>) -> ObjectDescriptor {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            SourceEntry {
                body: body.to_vec(),
                last_modified,
            },
        );
        descriptor(key, body, last_modified)
    }

    /// Keeps `key` in listings but makes opening it fail with not-found.
    pub fn vanish_on_open(&self, key: &str) {
        self.vanished.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.transient_list_failures.store(n, Ordering::SeqCst);
    }

    pub fn reject_lists(&self) {
        self.reject_lists.store(true, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list_page(
        &self,
        lease: &CredentialLease,
        prefix: &str,
        token: Option<&str>,
        page_size: i32,
    ) -> SyncResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if lease.is_expired() {
            return Err(SyncError::CredentialExpired);
        }
        if self.reject_lists.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("list rejected".into()));
        }
        let failing = self
            .transient_list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::TransientIo("503 SlowDown".into()));
        }

        let objects = self.objects.lock().unwrap();
        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| token.is_none_or(|t| key.as_str() > t));

        let page: Vec<ObjectDescriptor> = matching
            .by_ref()
            .take(page_size as usize)
            .map(|(key, entry)| descriptor(key, &entry.body, entry.last_modified))
            .collect();
        let more = matching.next().is_some();

        Ok(ListPage {
            next_token: if more {
                page.last().map(|d| d.key.clone())
            } else {
                None
            },
            objects: page,
        })
    }

    async fn open(&self, lease: &CredentialLease, key: &str) -> SyncResult<SourceObject> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if lease.is_expired() {
            return Err(SyncError::CredentialExpired);
        }
        if self.vanished.lock().unwrap().contains(key) {
            return Err(SyncError::NotFound(format!("NoSuchKey: {key}")));
        }

        let entry = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("NoSuchKey: {key}")))?;

        Ok(SourceObject {
            size: entry.body.len() as u64,
            fingerprint: fingerprint_of(&entry.body),
            content_type: Some("text/plain".into()),
            body: ByteStream::from(entry.body),
        })
    }
}

// ── Destination ─────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct DestinationEntry {
    body: Vec<u8>,
    source_fingerprint: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub enum PutFault {
    /// Fails with a transient error this many more times.
    Transient { remaining: u32 },
    /// Accepts the write but records a different fingerprint.
    Corrupt,
}

#[derive(Default)]
pub struct MemoryDestination {
    objects: Mutex<HashMap<String, DestinationEntry>>,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<HashMap<String, PutFault>>,
    written: Mutex<Vec<String>>,
    put_delay: Option<std::time::Duration>,
    put_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every object write takes `delay` (in tokio time).
    pub fn with_put_delay(delay: std::time::Duration) -> Self {
        Self {
            put_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn seed(&self, key: &str, body: &[u8], source_fingerprint: Option<&str>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            DestinationEntry {
                body: body.to_vec(),
                source_fingerprint: source_fingerprint.map(str::to_string),
            },
        );
    }

    pub fn seed_document(&self, key: &str, body: &[u8]) {
        self.documents
            .lock()
            .unwrap()
            .insert(key.to_string(), body.to_vec());
    }

    pub fn inject(&self, key: &str, fault: PutFault) {
        self.faults.lock().unwrap().insert(key.to_string(), fault);
    }

    pub fn heal(&self, key: &str) {
        self.faults.lock().unwrap().remove(key);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|e| e.body.clone())
    }

    pub fn source_fingerprint(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|e| e.source_fingerprint.clone())
    }

    pub fn document(&self, key: &str) -> Option<Vec<u8>> {
        self.documents.lock().unwrap().get(key).cloned()
    }

    /// Keys successfully written, in completion order.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_fault(&self, key: &str) -> Option<PutFault> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(key) {
            Some(PutFault::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Some(PutFault::Transient { remaining: *remaining })
            }
            Some(PutFault::Transient { .. }) => None,
            Some(PutFault::Corrupt) => Some(PutFault::Corrupt),
            None => None,
        }
    }

    async fn write(&self, key: &str, object: SourceObject) -> SyncResult<()> {
        if let Some(delay) = self.put_delay {
            tokio::time::sleep(delay).await;
        }

        let body = object
            .body
            .collect()
            .await
            .map_err(|e| SyncError::TransientIo(e.to_string()))?
            .into_bytes()
            .to_vec();

        let source_fingerprint = match self.take_fault(key) {
            Some(PutFault::Transient { .. }) => {
                return Err(SyncError::TransientIo(format!("503 SlowDown writing {key}")));
            }
            Some(PutFault::Corrupt) => Some("\"corrupted\"".to_string()),
            None => Some(object.fingerprint),
        };

        self.objects.lock().unwrap().insert(
            key.to_string(),
            DestinationEntry {
                body,
                source_fingerprint,
            },
        );
        self.written.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn head(&self, key: &str) -> SyncResult<Option<ObjectHead>> {
        Ok(self.objects.lock().unwrap().get(key).map(|e| ObjectHead {
            size: e.body.len() as u64,
            source_fingerprint: e.source_fingerprint.clone(),
        }))
    }

    async fn put_object(&self, key: &str, object: SourceObject) -> SyncResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.write(key, object).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_document(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.document(key))
    }

    async fn put_document(&self, key: &str, body: Vec<u8>) -> SyncResult<()> {
        self.documents.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }
}

// ── Engine wiring ───────────────────────────────────────────────

pub struct Harness {
    pub config: Arc<SyncConfig>,
    pub exchange: Arc<StaticExchange>,
    pub source: Arc<MemorySource>,
    pub destination: Arc<MemoryDestination>,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_parts(
            config,
            StaticExchange::new(),
            MemorySource::new(),
            MemoryDestination::new(),
        )
    }

    pub fn with_parts(
        config: SyncConfig,
        exchange: StaticExchange,
        source: MemorySource,
        destination: MemoryDestination,
    ) -> Self {
        Self {
            config: Arc::new(config),
            exchange: Arc::new(exchange),
            source: Arc::new(source),
            destination: Arc::new(destination),
        }
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            Arc::clone(&self.config),
            self.exchange.clone(),
            self.source.clone(),
            self.destination.clone(),
        )
    }

    /// The marker document as JSON, if one has been written.
    pub fn marker_json(&self) -> Option<serde_json::Value> {
        self.destination
            .document(&self.config.marker_key)
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
    }
}
