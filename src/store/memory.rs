//! In-memory `Bucket` — HashMap behind a `RwLock`, monotonic CAS tokens,
//! and lock TTL semantics. Intended for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Bucket, Cas, Stored, StoreError, WriteOptions};

struct LockState {
    cas: u64,
    until: Instant,
}

struct Entry {
    value: serde_json::Value,
    cas: u64,
    expires_at: Option<Instant>,
    lock: Option<LockState>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn locked(&self) -> bool {
        self.lock.as_ref().is_some_and(|l| Instant::now() < l.until)
    }

    /// A write is admitted when the entry is unlocked and the supplied CAS
    /// (if any) matches, or when the supplied CAS is the lock token.
    fn admits(&self, cas: Option<u64>) -> bool {
        if self.locked() {
            cas == Some(self.cas)
        } else {
            cas.is_none() || cas == Some(self.cas)
        }
    }
}

/// In-memory bucket. Clone-free; share it behind an `Arc`.
pub struct InMemoryBucket {
    entries: RwLock<HashMap<String, Entry>>,
    next_cas: AtomicU64,
}

impl InMemoryBucket {
    pub fn new() -> Self {
        InMemoryBucket {
            entries: RwLock::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
        }
    }

    fn fresh_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        let map = self.entries.read().expect("lock poisoned");
        map.values().filter(|e| !e.expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live document exists at `key`.
    pub fn contains(&self, key: &str) -> bool {
        let map = self.entries.read().expect("lock poisoned");
        map.get(key).is_some_and(|e| !e.expired())
    }

    /// Peek at a stored body without touching CAS or locks.
    pub fn peek(&self, key: &str) -> Option<serde_json::Value> {
        let map = self.entries.read().expect("lock poisoned");
        map.get(key)
            .filter(|e| !e.expired())
            .map(|e| e.value.clone())
    }

    /// Remove all documents.
    pub fn clear(&self) {
        self.entries.write().expect("lock poisoned").clear();
    }

    fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
        must_exist: bool,
        must_be_absent: bool,
    ) -> Result<Cas, StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        let existing = map.get(key).filter(|e| !e.expired());
        match existing {
            Some(entry) => {
                if must_be_absent {
                    return Err(StoreError::CasMismatch(key.to_string()));
                }
                if !entry.admits(options.cas.map(|c| c.0)) {
                    return Err(StoreError::CasMismatch(key.to_string()));
                }
            }
            None => {
                if must_exist {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                if options.cas.is_some() {
                    return Err(StoreError::NotFound(key.to_string()));
                }
            }
        }
        let cas = self.fresh_cas();
        map.insert(
            key.to_string(),
            Entry {
                value,
                cas,
                expires_at: options.expiry.map(|ttl| Instant::now() + ttl),
                lock: None,
            },
        );
        Ok(Cas(cas))
    }
}

impl Default for InMemoryBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBucket")
            .field("documents", &self.len())
            .finish()
    }
}

#[async_trait]
impl Bucket for InMemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        let map = self.entries.read().expect("lock poisoned");
        Ok(map.get(key).filter(|e| !e.expired()).map(|e| Stored {
            value: e.value.clone(),
            cas: Cas(e.cas),
        }))
    }

    async fn insert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.write(key, value, options, false, true)
    }

    async fn replace(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.write(key, value, options, true, false)
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        options: WriteOptions,
    ) -> Result<Cas, StoreError> {
        self.write(key, value, options, false, false)
    }

    async fn remove(&self, key: &str, cas: Option<Cas>) -> Result<(), StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        let entry = map
            .get(key)
            .filter(|e| !e.expired())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if !entry.admits(cas.map(|c| c.0)) {
            return Err(StoreError::CasMismatch(key.to_string()));
        }
        map.remove(key);
        Ok(())
    }

    async fn counter(
        &self,
        key: &str,
        delta: i64,
        initial: Option<i64>,
    ) -> Result<i64, StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        let current = map
            .get(key)
            .filter(|e| !e.expired())
            .and_then(|e| e.value.as_i64());
        let next = match current {
            Some(n) => n + delta,
            None => initial.ok_or_else(|| StoreError::NotFound(key.to_string()))?,
        };
        let cas = self.fresh_cas();
        map.insert(
            key.to_string(),
            Entry {
                value: serde_json::Value::from(next),
                cas,
                expires_at: None,
                lock: None,
            },
        );
        Ok(next)
    }

    async fn get_and_lock(&self, key: &str, ttl: Duration) -> Result<Stored, StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        let entry = map
            .get_mut(key)
            .filter(|e| !e.expired())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if entry.locked() {
            return Err(StoreError::Temporary(format!("key is locked: {}", key)));
        }
        let cas = self.fresh_cas();
        entry.cas = cas;
        entry.lock = Some(LockState {
            cas,
            until: Instant::now() + ttl,
        });
        Ok(Stored {
            value: entry.value.clone(),
            cas: Cas(cas),
        })
    }

    async fn unlock(&self, key: &str, cas: Cas) -> Result<(), StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        let entry = map
            .get_mut(key)
            .filter(|e| !e.expired())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        match &entry.lock {
            Some(lock) if lock.cas == cas.0 => {
                entry.lock = None;
                Ok(())
            }
            _ => Err(StoreError::CasMismatch(key.to_string())),
        }
    }
}
