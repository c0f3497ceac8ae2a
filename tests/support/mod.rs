#![allow(dead_code)]

//! Shared test fixtures: an ODM over the in-memory bucket plus bucket
//! wrappers that count, fail, or flake on demand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docket::{Bucket, Cas, InMemoryBucket, Odm, OdmConfig, Stored, StoreError, WriteOptions};

/// ODM over a shared in-memory bucket; the bucket handle lets tests peek at
/// raw stored bodies.
pub fn odm_with_memory(config: OdmConfig) -> (Odm, Arc<InMemoryBucket>) {
    let bucket = Arc::new(InMemoryBucket::new());
    let shared: Arc<dyn Bucket> = bucket.clone();
    (Odm::with_bucket(shared, config), bucket)
}

/// Counts primary operations while delegating to an inner bucket.
pub struct CountingBucket {
    inner: InMemoryBucket,
    pub upserts: AtomicUsize,
    pub inserts: AtomicUsize,
    pub removes: AtomicUsize,
    pub reads: AtomicUsize,
}

impl CountingBucket {
    pub fn new() -> Self {
        CountingBucket {
            inner: InMemoryBucket::new(),
            upserts: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bucket for CountingBucket {
    async fn get(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn insert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(key, value, options).await
    }

    async fn replace(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.inner.replace(key, value, options).await
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(key, value, options).await
    }

    async fn remove(&self, key: &str, cas: Option<Cas>) -> Result<(), StoreError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key, cas).await
    }

    async fn counter(
        &self,
        key: &str,
        delta: i64,
        initial: Option<i64>,
    ) -> Result<i64, StoreError> {
        self.inner.counter(key, delta, initial).await
    }

    async fn get_and_lock(&self, key: &str, ttl: Duration) -> Result<Stored, StoreError> {
        self.inner.get_and_lock(key, ttl).await
    }

    async fn unlock(&self, key: &str, cas: Cas) -> Result<(), StoreError> {
        self.inner.unlock(key, cas).await
    }
}

/// Fails the next `failures` upserts with a temporary error, then behaves.
pub struct FlakyBucket {
    inner: InMemoryBucket,
    failures: AtomicUsize,
}

impl FlakyBucket {
    pub fn new(failures: usize) -> Self {
        FlakyBucket {
            inner: InMemoryBucket::new(),
            failures: AtomicUsize::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Bucket for FlakyBucket {
    async fn get(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        self.inner.get(key).await
    }

    async fn insert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.inner.insert(key, value, options).await
    }

    async fn replace(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.inner.replace(key, value, options).await
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        if self.should_fail() {
            return Err(StoreError::Temporary("injected failure".into()));
        }
        self.inner.upsert(key, value, options).await
    }

    async fn remove(&self, key: &str, cas: Option<Cas>) -> Result<(), StoreError> {
        self.inner.remove(key, cas).await
    }

    async fn counter(
        &self,
        key: &str,
        delta: i64,
        initial: Option<i64>,
    ) -> Result<i64, StoreError> {
        self.inner.counter(key, delta, initial).await
    }

    async fn get_and_lock(&self, key: &str, ttl: Duration) -> Result<Stored, StoreError> {
        self.inner.get_and_lock(key, ttl).await
    }

    async fn unlock(&self, key: &str, cas: Cas) -> Result<(), StoreError> {
        self.inner.unlock(key, cas).await
    }
}

/// Fails every write touching a key that contains `marker`. Lets tests
/// break lookup-document maintenance while primary writes succeed.
pub struct KeyFailBucket {
    inner: InMemoryBucket,
    marker: String,
}

impl KeyFailBucket {
    pub fn new(marker: impl Into<String>) -> Self {
        KeyFailBucket {
            inner: InMemoryBucket::new(),
            marker: marker.into(),
        }
    }

    fn poisoned(&self, key: &str) -> Option<StoreError> {
        key.contains(&self.marker)
            .then(|| StoreError::Fatal(format!("poisoned key: {}", key)))
    }
}

#[async_trait]
impl Bucket for KeyFailBucket {
    async fn get(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        self.inner.get(key).await
    }

    async fn insert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        if let Some(err) = self.poisoned(key) {
            return Err(err);
        }
        self.inner.insert(key, value, options).await
    }

    async fn replace(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        if let Some(err) = self.poisoned(key) {
            return Err(err);
        }
        self.inner.replace(key, value, options).await
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        if let Some(err) = self.poisoned(key) {
            return Err(err);
        }
        self.inner.upsert(key, value, options).await
    }

    async fn remove(&self, key: &str, cas: Option<Cas>) -> Result<(), StoreError> {
        if let Some(err) = self.poisoned(key) {
            return Err(err);
        }
        self.inner.remove(key, cas).await
    }

    async fn counter(
        &self,
        key: &str,
        delta: i64,
        initial: Option<i64>,
    ) -> Result<i64, StoreError> {
        self.inner.counter(key, delta, initial).await
    }

    async fn get_and_lock(&self, key: &str, ttl: Duration) -> Result<Stored, StoreError> {
        if let Some(err) = self.poisoned(key) {
            return Err(err);
        }
        self.inner.get_and_lock(key, ttl).await
    }

    async fn unlock(&self, key: &str, cas: Cas) -> Result<(), StoreError> {
        self.inner.unlock(key, cas).await
    }
}
