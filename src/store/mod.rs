//! Abstract store interface — per-key CRUD, atomic counters, and CAS-based
//! optimistic concurrency over an asynchronous key-value document store.

mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::OdmConfig;

pub use memory::InMemoryBucket;

/// Opaque compare-and-swap token returned by the store. Comparable only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cas(pub(crate) u64);

/// A stored document together with its current CAS token.
#[derive(Clone, Debug)]
pub struct Stored {
    pub value: serde_json::Value,
    pub cas: Cas,
}

/// Per-write options. `cas` turns a blind write into a guarded one.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub cas: Option<Cas>,
    pub expiry: Option<Duration>,
    pub persist_to: Option<u8>,
    pub replicate_to: Option<u8>,
}

impl WriteOptions {
    pub fn with_cas(cas: Cas) -> Self {
        WriteOptions {
            cas: Some(cas),
            ..WriteOptions::default()
        }
    }
}

/// Closed set of store failure kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    CasMismatch(String),
    Temporary(String),
    Timeout(String),
    Fatal(String),
}

impl StoreError {
    /// Only `Temporary` participates in the temporary-error retry budget;
    /// timeouts surface on the in-flight call and propagate.
    pub fn is_temporary(&self) -> bool {
        matches!(self, StoreError::Temporary(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "key not found: {}", key),
            StoreError::CasMismatch(key) => write!(f, "cas mismatch on {}", key),
            StoreError::Temporary(msg) => write!(f, "temporary failure: {}", msg),
            StoreError::Timeout(msg) => write!(f, "operation timed out: {}", msg),
            StoreError::Fatal(msg) => write!(f, "fatal store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Asynchronous document store. Implementations are shared by all tasks and
/// must be safe for concurrent use.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Fetch one document. A miss is `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<Stored>, StoreError>;

    /// Fetch many documents in one round-trip. The result is aligned with
    /// the input: misses are `None`. The default implementation loops
    /// `get`; backends override for a real batched read.
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<Stored>>, StoreError> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    /// Create a document. Fails with `CasMismatch` if the key exists.
    async fn insert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError>;

    /// Replace an existing document. Fails with `NotFound` if absent.
    async fn replace(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError>;

    /// Create or replace a document.
    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError>;

    /// Delete a document, optionally guarded by a CAS token.
    async fn remove(&self, key: &str, cas: Option<Cas>) -> Result<(), StoreError>;

    /// Adjust an atomic counter. When the key is absent and `initial` is
    /// given, the counter starts at `initial`; otherwise `NotFound`.
    async fn counter(
        &self,
        key: &str,
        delta: i64,
        initial: Option<i64>,
    ) -> Result<i64, StoreError>;

    /// Fetch a document and lock it for `ttl`. While locked, writes that do
    /// not carry the returned CAS fail with `CasMismatch`, and further lock
    /// attempts fail with `Temporary`.
    async fn get_and_lock(&self, key: &str, ttl: Duration) -> Result<Stored, StoreError>;

    /// Release a lock taken by `get_and_lock`.
    async fn unlock(&self, key: &str, cas: Cas) -> Result<(), StoreError>;
}

/// Run a store call, retrying `Temporary` failures within the configured
/// budget when `retry_temporary_errors` is on.
pub(crate) async fn with_temp_retry<T, F, Fut>(
    config: &OdmConfig,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Err(err)
                if err.is_temporary()
                    && config.retry_temporary_errors
                    && attempts < config.temp_retry_times =>
            {
                attempts += 1;
                tracing::debug!(attempt = attempts, error = %err, "retrying temporary store failure");
                if !config.temp_retry_interval.is_zero() {
                    tokio::time::sleep(config.temp_retry_interval).await;
                }
            }
            other => return other,
        }
    }
}
