//! Model façade — a named, compiled schema bound to an ODM handle. Carries
//! the find/hydrate/populate half of the document engine and the dispatch
//! table for user statics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::document::{Document, RemoveOptions};
use crate::error::OdmError;
use crate::index;
use crate::key;
use crate::odm::Odm;
use crate::schema::{BoxFuture, Schema};
use crate::store::{with_temp_retry, Stored};
use crate::value::Value;

/// Which embedded references `find` operations expand.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Populate {
    /// Leave references as key scalars.
    #[default]
    None,
    /// Expand every model-typed field, breadth-first, batched per model.
    All,
    /// Expand exactly one field; `"field.N"` expands one array slot.
    Path(String),
    /// Expand each listed path.
    Paths(Vec<String>),
}

/// Options for the `find` family.
#[derive(Clone, Default)]
pub struct FindOptions {
    pub populate: Populate,
    /// Override the config `missing` setting.
    pub missing: Option<bool>,
    /// Override the config `keep_sort_order` setting. Batched reads are
    /// input-aligned, so both orders coincide for this store contract.
    pub keep_sort_order: Option<bool>,
}

/// Result of a multi-id find: hydrated documents plus the ids that missed.
#[derive(Debug, Default)]
pub struct FindResult {
    pub documents: Vec<Document>,
    pub misses: Vec<String>,
}

/// A compiled model: name, schema, and the owning ODM handle.
#[derive(Clone)]
pub struct Model {
    odm: Odm,
    name: String,
    schema: Arc<Schema>,
}

impl Model {
    pub(crate) fn new(odm: Odm, name: String, schema: Arc<Schema>) -> Self {
        Model { odm, name, schema }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn odm(&self) -> &Odm {
        &self.odm
    }

    /// New empty document with defaults applied.
    pub fn create(&self) -> Document {
        let mut doc = Document::new(self.name.clone(), Arc::clone(&self.schema), self.odm.clone());
        doc.apply_defaults();
        doc
    }

    /// New document from a plain JSON object. Each entry runs the full
    /// write pipeline; rejections accumulate on the instance.
    pub fn create_from(&self, data: serde_json::Value) -> Document {
        let mut doc = Document::new(self.name.clone(), Arc::clone(&self.schema), self.odm.clone());
        if let serde_json::Value::Object(map) = data {
            for (name, value) in map {
                doc.set(&name, Value::from_json(value));
            }
        }
        doc.apply_defaults();
        doc
    }

    /// Call a schema-registered static.
    pub fn call_static(&self, name: &str, args: Value) -> Option<Value> {
        let f = self.schema.static_member(name)?.clone();
        Some(f(self, args))
    }

    /// Shorthand for [`Model::find_by_id`] with default options.
    pub async fn find(&self, id: &str) -> Result<Option<Document>, OdmError> {
        self.find_by_id(id, FindOptions::default()).await
    }

    /// Remove the documents behind `ids`. Missing ids are skipped; each hit
    /// goes through the full document remove (hooks, index purge, events).
    pub async fn remove(&self, ids: &[&str], options: RemoveOptions) -> Result<(), OdmError> {
        let found = self.find_by_ids(ids, FindOptions::default()).await?;
        for mut doc in found.documents {
            doc.remove(options.clone()).await?;
        }
        Ok(())
    }

    /// Fetch one document by user-visible key. A store miss is `Ok(None)`.
    pub async fn find_by_id(
        &self,
        id: &str,
        options: FindOptions,
    ) -> Result<Option<Document>, OdmError> {
        let result = self.find_by_ids(&[id], options).await?;
        Ok(result.documents.into_iter().next())
    }

    /// Fetch many documents in a single batched read. Hits hydrate in
    /// hydration mode (validators skipped, CAS recorded); `misses` lists
    /// the ids that did not resolve, unless `missing` is off.
    pub async fn find_by_ids(
        &self,
        ids: &[&str],
        options: FindOptions,
    ) -> Result<FindResult, OdmError> {
        let config = self.odm.config().clone();
        let key_field = self.schema.key_field();
        let mut storage_keys = Vec::with_capacity(ids.len());
        for id in ids {
            storage_keys.push(key::storage_key(
                &Value::String((*id).to_string()),
                key_field,
                &self.schema,
                &config,
            )?);
        }

        let bucket = self.odm.bucket();
        let results = with_temp_retry(&config, || {
            let bucket = bucket.clone();
            let keys = storage_keys.clone();
            async move { bucket.get_multi(&keys).await }
        })
        .await?;

        let mut documents = Vec::new();
        let mut misses = Vec::new();
        for (idx, slot) in results.into_iter().enumerate() {
            match slot {
                Some(stored) => documents.push(self.hydrate(&stored)?),
                None => misses.push(ids[idx].to_string()),
            }
        }

        self.populate(&mut documents, &options.populate).await?;

        if !options.missing.unwrap_or(config.missing) {
            misses.clear();
        }
        Ok(FindResult { documents, misses })
    }

    /// Resolve one document through its lookup reference. Returns the
    /// current owner of `(field, value)`, or `None`; with
    /// `error_on_missing_index`, broken lookups raise
    /// [`OdmError::DanglingIndex`] instead.
    pub async fn find_by(
        &self,
        field: &str,
        value: impl Into<Value>,
        options: FindOptions,
    ) -> Result<Option<Document>, OdmError> {
        let value = value.into();
        let config = self.odm.config().clone();
        let Some(descriptor) = self.schema.resolve(field) else {
            tracing::warn!(model = %self.name, field, "find_by on unknown field");
            return Ok(None);
        };
        if !descriptor.index {
            tracing::warn!(model = %self.name, field, "find_by on unindexed field");
            return Ok(None);
        }
        let index_name = descriptor
            .index_name
            .clone()
            .unwrap_or_else(|| key::derive_index_name(&descriptor.name));
        let value_str = key::stringify(&value)?;
        let ref_key = key::ref_key(&index_name, &value_str, &self.schema, &config);

        let bucket = self.odm.bucket();
        let Some(target) = index::resolve_ref(&bucket, &config, &ref_key).await? else {
            if config.error_on_missing_index {
                return Err(OdmError::DanglingIndex {
                    target: ref_key.clone(),
                    ref_key,
                });
            }
            return Ok(None);
        };

        let found = if self.schema.store_full_reference_id(&config) {
            self.find_by_storage_key(&target, &options.populate).await?
        } else {
            self.find_by_id(&target, options).await?
        };
        if found.is_none() && config.error_on_missing_index {
            return Err(OdmError::DanglingIndex { ref_key, target });
        }
        Ok(found)
    }

    /// Direct fetch by full storage key (lookup payloads under
    /// `store_full_reference_id`).
    pub(crate) async fn find_by_storage_key(
        &self,
        storage_key: &str,
        populate: &Populate,
    ) -> Result<Option<Document>, OdmError> {
        let config = self.odm.config().clone();
        let bucket = self.odm.bucket();
        let stored = with_temp_retry(&config, || {
            let bucket = bucket.clone();
            let key = storage_key.to_string();
            async move { bucket.get(&key).await }
        })
        .await?;
        match stored {
            Some(stored) => {
                let mut documents = vec![self.hydrate(&stored)?];
                self.populate(&mut documents, populate).await?;
                Ok(documents.pop())
            }
            None => Ok(None),
        }
    }

    /// Build an instance from a stored body: hydration-mode writes, CAS
    /// recorded, shadow snapshot taken.
    pub(crate) fn hydrate(&self, stored: &Stored) -> Result<Document, OdmError> {
        let serde_json::Value::Object(map) = &stored.value else {
            return Err(OdmError::Serialization(format!(
                "stored document for model {} is not an object",
                self.name
            )));
        };
        let mut doc = Document::new(self.name.clone(), Arc::clone(&self.schema), self.odm.clone());
        let config = self.odm.config();
        let store_full_key = self.schema.store_full_key(config);
        for (name, json) in map {
            let Some(field) = self.schema.field(name) else {
                continue;
            };
            let mut value = Value::from_json(json.clone());
            if field.is_key() && store_full_key {
                if let Value::String(s) = &value {
                    value = Value::String(key::user_key(s, field, &self.schema, config).to_string());
                }
            }
            doc.set_raw(&field.name, value);
        }
        doc.set_cas(stored.cas);
        doc.mark_persisted();
        doc.refresh_shadow();
        Ok(doc)
    }

    async fn populate(
        &self,
        documents: &mut [Document],
        populate: &Populate,
    ) -> Result<(), OdmError> {
        match populate {
            Populate::None => Ok(()),
            Populate::All => {
                let mut visited = HashSet::new();
                for doc in documents.iter_mut() {
                    if let Ok(key) = doc.storage_key() {
                        visited.insert(key);
                    }
                }
                for doc in documents.iter_mut() {
                    populate_all(doc, &mut visited).await?;
                }
                Ok(())
            }
            Populate::Path(path) => {
                for doc in documents.iter_mut() {
                    populate_path(doc, path).await?;
                }
                Ok(())
            }
            Populate::Paths(paths) => {
                for path in paths {
                    for doc in documents.iter_mut() {
                        populate_path(doc, path).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Batched hydration keyed by user-visible key. Misses are absent.
    pub(crate) async fn fetch_many(
        &self,
        user_keys: &[String],
    ) -> Result<HashMap<String, Document>, OdmError> {
        let config = self.odm.config().clone();
        let key_field = self.schema.key_field();
        let mut storage_keys = Vec::with_capacity(user_keys.len());
        for user_key in user_keys {
            storage_keys.push(key::storage_key(
                &Value::String(user_key.clone()),
                key_field,
                &self.schema,
                &config,
            )?);
        }
        let bucket = self.odm.bucket();
        let results = with_temp_retry(&config, || {
            let bucket = bucket.clone();
            let keys = storage_keys.clone();
            async move { bucket.get_multi(&keys).await }
        })
        .await?;

        let mut out = HashMap::new();
        for (idx, slot) in results.into_iter().enumerate() {
            if let Some(stored) = slot {
                out.insert(user_keys[idx].clone(), self.hydrate(&stored)?);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("name", &self.name).finish()
    }
}

/// One unhydrated reference slot: field, optional array index, target
/// model, user-visible key.
struct RefSlot {
    field: String,
    index: Option<usize>,
    model: String,
    key: String,
}

fn scalar_ref_slots(doc: &Document) -> Vec<RefSlot> {
    doc.scalar_ref_slots()
        .into_iter()
        .map(|(field, index, model, key)| RefSlot {
            field,
            index,
            model,
            key,
        })
        .collect()
}

fn assign_slot(doc: &mut Document, field: &str, index: Option<usize>, child: Document) {
    match index {
        None => {
            if let Some(value) = doc.raw_mut(field) {
                *value = Value::Doc(Box::new(child));
            }
        }
        Some(idx) => {
            if let Some(Value::Array(items)) = doc.raw_mut(field) {
                if let Some(slot) = items.get_mut(idx) {
                    *slot = Value::Doc(Box::new(child));
                }
            }
        }
    }
}

/// Recursive breadth-first population: hydrate this document's scalar
/// references (batched per target model), then descend. Keys already
/// hydrated in this operation stay scalars, which terminates mutual
/// reference chains.
fn populate_all<'a>(
    doc: &'a mut Document,
    visited: &'a mut HashSet<String>,
) -> BoxFuture<'a, Result<(), OdmError>> {
    Box::pin(async move {
        let slots = scalar_ref_slots(doc);
        let mut by_model: HashMap<String, Vec<RefSlot>> = HashMap::new();
        for slot in slots {
            by_model.entry(slot.model.clone()).or_default().push(slot);
        }

        for (model_name, slots) in by_model {
            let Some(target) = doc.odm().model_named(&model_name) else {
                tracing::warn!(model = %model_name, "populate target model not registered");
                continue;
            };
            let mut keys: Vec<String> = Vec::new();
            for slot in &slots {
                let storage = key::storage_key(
                    &Value::String(slot.key.clone()),
                    target.schema().key_field(),
                    target.schema(),
                    doc.odm().config(),
                )?;
                if !visited.contains(&storage) && !keys.contains(&slot.key) {
                    keys.push(slot.key.clone());
                }
            }
            if keys.is_empty() {
                continue;
            }
            let fetched = target.fetch_many(&keys).await?;
            for slot in slots {
                if let Some(child) = fetched.get(&slot.key) {
                    visited.insert(child.storage_key()?);
                    assign_slot(doc, &slot.field, slot.index, child.clone());
                }
            }
        }

        for (field, slot) in doc.embedded_slots() {
            if let Some(child) = doc.embedded_child(&field, slot) {
                populate_all(child, visited).await?;
            }
        }
        Ok(())
    })
}

/// Expand a single `field` or `field.N` path, one level deep.
async fn populate_path(doc: &mut Document, path: &str) -> Result<(), OdmError> {
    let (field_name, index) = match path.split_once('.') {
        Some((field, idx)) => match idx.parse::<usize>() {
            Ok(idx) => (field, Some(idx)),
            Err(_) => {
                tracing::warn!(path, "unparseable populate path");
                return Ok(());
            }
        },
        None => (path, None),
    };

    let slots: Vec<RefSlot> = scalar_ref_slots(doc)
        .into_iter()
        .filter(|slot| slot.field == field_name && (index.is_none() || slot.index == index))
        .collect();
    if slots.is_empty() {
        return Ok(());
    }

    let Some(target) = doc.odm().model_named(&slots[0].model) else {
        tracing::warn!(model = %slots[0].model, "populate target model not registered");
        return Ok(());
    };
    let mut keys: Vec<String> = Vec::new();
    for slot in &slots {
        if !keys.contains(&slot.key) {
            keys.push(slot.key.clone());
        }
    }
    let fetched = target.fetch_many(&keys).await?;
    for slot in slots {
        if let Some(child) = fetched.get(&slot.key) {
            assign_slot(doc, &slot.field, slot.index, child.clone());
        }
    }
    Ok(())
}
