//! Index maintainer — keeps lookup reference documents (`{key: …}`) in
//! step with the indexed field values of saved and removed documents.
//!
//! Every lookup mutation runs a bounded CAS loop, optionally serialized
//! with `get_and_lock`. Races resolve last-write-wins: a save that claims
//! an indexed value owned by another document replaces the lookup payload
//! and does not sweep the prior owner.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::config::OdmConfig;
use crate::error::OdmError;
use crate::key;
use crate::schema::Schema;
use crate::store::{with_temp_retry, Bucket, StoreError, WriteOptions};

const LOCK_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IndexOp {
    Add,
    Remove,
}

#[derive(Clone, Debug)]
pub(crate) struct IndexUpdate {
    pub ref_key: String,
    pub op: IndexOp,
}

/// Diff the shadow snapshot against current values: removals first, then
/// additions, each expanded per indexed value.
pub(crate) fn compute_updates(
    schema: &Schema,
    config: &OdmConfig,
    old: &HashMap<String, BTreeSet<String>>,
    new: &HashMap<String, BTreeSet<String>>,
) -> Vec<IndexUpdate> {
    let mut updates = Vec::new();
    let empty = BTreeSet::new();
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for name in names {
        let old_set = old.get(name.as_str()).unwrap_or(&empty);
        let new_set = new.get(name.as_str()).unwrap_or(&empty);
        for value in old_set.difference(new_set) {
            updates.push(IndexUpdate {
                ref_key: key::ref_key(name, value, schema, config),
                op: IndexOp::Remove,
            });
        }
        for value in new_set.difference(old_set) {
            updates.push(IndexUpdate {
                ref_key: key::ref_key(name, value, schema, config),
                op: IndexOp::Add,
            });
        }
    }
    updates
}

/// Apply lookup updates for a document whose lookup payloads should carry
/// `target`. Failures are collected, never raised — the caller decides
/// whether they fail the save (`wait_for_index`) or surface as events.
pub(crate) async fn apply(
    bucket: &Arc<dyn Bucket>,
    config: &OdmConfig,
    updates: Vec<IndexUpdate>,
    target: &str,
) -> Vec<OdmError> {
    let mut errors = Vec::new();
    for update in updates {
        if let Err(err) = apply_update(bucket, config, &update, target).await {
            tracing::warn!(ref_key = %update.ref_key, error = %err, "lookup document update failed");
            errors.push(err);
        }
    }
    errors
}

async fn apply_update(
    bucket: &Arc<dyn Bucket>,
    config: &OdmConfig,
    update: &IndexUpdate,
    target: &str,
) -> Result<(), OdmError> {
    let mut attempts = 0u32;
    loop {
        let step = if config.atomic_lock {
            attempt_locked(bucket, update, target).await
        } else {
            attempt_unlocked(bucket, update, target).await
        };
        match step {
            Ok(()) => return Ok(()),
            Err(err) if matches!(err, StoreError::CasMismatch(_) | StoreError::Temporary(_)) => {
                attempts += 1;
                if attempts > config.atomic_retry_times {
                    return Err(OdmError::ConcurrentModification(update.ref_key.clone()));
                }
                tracing::debug!(
                    ref_key = %update.ref_key,
                    attempt = attempts,
                    "retrying lookup document update"
                );
                if !config.atomic_retry_interval.is_zero() {
                    tokio::time::sleep(config.atomic_retry_interval).await;
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn payload(target: &str) -> serde_json::Value {
    serde_json::json!({ "key": target })
}

fn payload_target(stored: &serde_json::Value) -> Option<&str> {
    stored.get("key").and_then(|k| k.as_str())
}

async fn attempt_locked(
    bucket: &Arc<dyn Bucket>,
    update: &IndexUpdate,
    target: &str,
) -> Result<(), StoreError> {
    match bucket.get_and_lock(&update.ref_key, LOCK_TTL).await {
        Ok(stored) => match update.op {
            IndexOp::Add => {
                if payload_target(&stored.value) != Some(target) {
                    tracing::debug!(ref_key = %update.ref_key, "lookup owner replaced");
                }
                bucket
                    .replace(
                        &update.ref_key,
                        payload(target),
                        WriteOptions::with_cas(stored.cas),
                    )
                    .await?;
                Ok(())
            }
            IndexOp::Remove => {
                if payload_target(&stored.value) == Some(target) {
                    bucket.remove(&update.ref_key, Some(stored.cas)).await
                } else {
                    // another document owns this value now
                    bucket.unlock(&update.ref_key, stored.cas).await
                }
            }
        },
        Err(StoreError::NotFound(_)) => match update.op {
            IndexOp::Add => {
                bucket
                    .insert(&update.ref_key, payload(target), WriteOptions::default())
                    .await?;
                Ok(())
            }
            IndexOp::Remove => Ok(()),
        },
        Err(err) => Err(err),
    }
}

async fn attempt_unlocked(
    bucket: &Arc<dyn Bucket>,
    update: &IndexUpdate,
    target: &str,
) -> Result<(), StoreError> {
    match (update.op, bucket.get(&update.ref_key).await?) {
        (IndexOp::Add, Some(stored)) => {
            if payload_target(&stored.value) != Some(target) {
                tracing::debug!(ref_key = %update.ref_key, "lookup owner replaced");
            }
            bucket
                .replace(
                    &update.ref_key,
                    payload(target),
                    WriteOptions::with_cas(stored.cas),
                )
                .await?;
            Ok(())
        }
        (IndexOp::Add, None) => {
            bucket
                .insert(&update.ref_key, payload(target), WriteOptions::default())
                .await?;
            Ok(())
        }
        (IndexOp::Remove, Some(stored)) => {
            if payload_target(&stored.value) == Some(target) {
                bucket.remove(&update.ref_key, Some(stored.cas)).await
            } else {
                Ok(())
            }
        }
        (IndexOp::Remove, None) => Ok(()),
    }
}

/// Resolve a lookup document to the primary reference it carries.
pub(crate) async fn resolve_ref(
    bucket: &Arc<dyn Bucket>,
    config: &OdmConfig,
    ref_key: &str,
) -> Result<Option<String>, OdmError> {
    let stored = with_temp_retry(config, || {
        let bucket = bucket.clone();
        let key = ref_key.to_string();
        async move { bucket.get(&key).await }
    })
    .await?;
    match stored {
        Some(stored) => match payload_target(&stored.value) {
            Some(target) => Ok(Some(target.to_string())),
            None => Err(OdmError::Serialization(format!(
                "lookup document {} has no key payload",
                ref_key
            ))),
        },
        None => Ok(None),
    }
}
