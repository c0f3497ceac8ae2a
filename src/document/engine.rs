//! Save and remove — the document engine half of an instance. Owns the CAS
//! state machine, embedded-document recursion, hook execution, and the
//! handoff to the index maintainer.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use crate::document::{Document, EventKind};
use crate::error::OdmError;
use crate::index;
use crate::model::FindOptions;
use crate::schema::{run_hooks, BoxFuture, FieldKind};
use crate::store::{with_temp_retry, StoreError, WriteOptions};
use crate::value::Value;

/// Options for [`Document::save`].
#[derive(Clone, Default)]
pub struct SaveOptions {
    /// Serialize virtuals into the stored body.
    pub virtuals: bool,
    /// Override the schema/config minimize setting.
    pub minimize: Option<bool>,
    /// Document TTL.
    pub expiry: Option<Duration>,
    pub persist_to: Option<u8>,
    pub replicate_to: Option<u8>,
    /// Override the config `wait_for_index` setting.
    pub wait_for_index: Option<bool>,
}

/// Options for [`Document::remove`].
#[derive(Clone, Default)]
pub struct RemoveOptions {
    /// Recursively remove hydrated embedded documents first.
    pub remove_refs: bool,
    /// Raw delete: no hooks, no recursion, no index maintenance. A missing
    /// document counts as success.
    pub lean: bool,
}

impl Document {
    /// Persist this document.
    ///
    /// Pre-hooks run first; hydrated embedded documents save depth-first,
    /// left-to-right, before the parent body upserts; lookup documents
    /// update after the primary write. A failed child save aborts the
    /// outer save and surfaces the child's error — children that already
    /// saved are not rolled back.
    ///
    /// When the instance holds a CAS token the upsert is guarded by it; a
    /// conflict fails with [`OdmError::ConcurrentModification`] and leaves
    /// the stored document unchanged.
    pub async fn save(&mut self, options: SaveOptions) -> Result<(), OdmError> {
        let mut path = Vec::new();
        self.save_inner(&options, &mut path).await
    }

    fn save_inner<'a>(
        &'a mut self,
        options: &'a SaveOptions,
        path: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<(), OdmError>> {
        Box::pin(async move {
            let schema = self.schema_arc();
            if let Some(chain) = schema.hook_chain("save") {
                run_hooks(&chain.pre, self).await?;
            }

            let storage_key = self.ensure_key()?;
            if path.contains(&storage_key) {
                return Err(OdmError::CyclicEmbedding(storage_key));
            }
            path.push(storage_key.clone());
            for (field, slot) in self.embedded_slots() {
                if let Some(child) = self.embedded_child(&field, slot) {
                    child.save_inner(options, path).await?;
                }
            }
            path.pop();

            let body = self.to_stored(options.virtuals, options.minimize)?;
            let config = self.odm().config().clone();
            let bucket = self.odm().bucket();
            let write = WriteOptions {
                cas: self.cas(),
                expiry: options.expiry,
                persist_to: options.persist_to,
                replicate_to: options.replicate_to,
            };
            let result = with_temp_retry(&config, || {
                let bucket = bucket.clone();
                let key = storage_key.clone();
                let body = body.clone();
                let write = write.clone();
                async move { bucket.upsert(&key, body, write).await }
            })
            .await;
            let cas = match result {
                Ok(cas) => cas,
                Err(StoreError::CasMismatch(_)) => {
                    return Err(OdmError::ConcurrentModification(storage_key))
                }
                Err(err) => return Err(err.into()),
            };
            self.set_cas(cas);
            self.mark_persisted();

            let current = self.current_index_values();
            let updates =
                index::compute_updates(&schema, &config, self.shadow(), &current);
            let index_errors = if updates.is_empty() {
                Vec::new()
            } else {
                let target = self.index_target(&storage_key)?;
                index::apply(&bucket, &config, updates, &target).await
            };
            self.refresh_shadow();

            let wait = options.wait_for_index.unwrap_or(config.wait_for_index);
            if wait && !index_errors.is_empty() {
                return Err(OdmError::IndexFailed(index_errors));
            }
            self.emit(EventKind::Index, &index_errors);

            if let Some(chain) = schema.hook_chain("save") {
                if let Err(err) = run_hooks(&chain.post, self).await {
                    self.report_post_hook_error("save", err, &config);
                }
            }
            self.emit(EventKind::Save, &[]);
            Ok(())
        })
    }

    /// Remove this document from the store. The in-memory state is kept for
    /// post-hooks; the instance detaches (no CAS, no longer persisted).
    ///
    /// With `remove_refs`, embedded references — hydrated or key scalars —
    /// are removed depth-first; a visited set guarantees each reachable
    /// document is removed exactly once.
    pub async fn remove(&mut self, options: RemoveOptions) -> Result<(), OdmError> {
        if options.lean {
            return self.lean_remove().await;
        }
        let mut seen = HashSet::new();
        self.remove_inner(&options, &mut seen).await
    }

    fn remove_inner<'a>(
        &'a mut self,
        options: &'a RemoveOptions,
        seen: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<(), OdmError>> {
        Box::pin(async move {
            if !seen.insert(self.storage_key()?) {
                return Ok(());
            }
            let schema = self.schema_arc();
            if let Some(chain) = schema.hook_chain("remove") {
                run_hooks(&chain.pre, self).await?;
            }

            if options.remove_refs {
                for (field, slot) in self.embedded_slots() {
                    if let Some(child) = self.embedded_child(&field, slot) {
                        child.remove_inner(options, seen).await?;
                    }
                }
                for (_, _, model_name, user_key) in self.scalar_ref_slots() {
                    let Some(model) = self.odm().model_named(&model_name) else {
                        tracing::warn!(model = %model_name, "reference target model not registered");
                        continue;
                    };
                    if let Some(mut child) =
                        model.find_by_id(&user_key, FindOptions::default()).await?
                    {
                        child.remove_inner(options, seen).await?;
                    }
                }
            }

            let storage_key = self.storage_key()?;
            let config = self.odm().config().clone();
            let bucket = self.odm().bucket();
            let cas = self.cas();
            let result = with_temp_retry(&config, || {
                let bucket = bucket.clone();
                let key = storage_key.clone();
                async move { bucket.remove(&key, cas).await }
            })
            .await;
            match result {
                Ok(()) => {}
                Err(StoreError::CasMismatch(_)) => {
                    return Err(OdmError::ConcurrentModification(storage_key))
                }
                Err(err) => return Err(err.into()),
            }

            let updates = index::compute_updates(
                &schema,
                &config,
                self.shadow(),
                &Default::default(),
            );
            let index_errors = if updates.is_empty() {
                Vec::new()
            } else {
                let target = self.index_target(&storage_key)?;
                index::apply(&bucket, &config, updates, &target).await
            };
            self.clear_shadow();
            self.detach();
            self.emit(EventKind::Index, &index_errors);

            if let Some(chain) = schema.hook_chain("remove") {
                if let Err(err) = run_hooks(&chain.post, self).await {
                    self.report_post_hook_error("remove", err, &config);
                }
            }
            self.emit(EventKind::Remove, &[]);
            Ok(())
        })
    }

    async fn lean_remove(&mut self) -> Result<(), OdmError> {
        let storage_key = self.storage_key()?;
        let config = self.odm().config().clone();
        let bucket = self.odm().bucket();
        let result = with_temp_retry(&config, || {
            let bucket = bucket.clone();
            let key = storage_key.clone();
            async move { bucket.remove(&key, None).await }
        })
        .await;
        match result {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                self.detach();
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run a custom-named hook chain (pre, then post).
    pub async fn run_hook_chain(&mut self, event: &str) -> Result<(), OdmError> {
        let schema = self.schema_arc();
        if let Some(chain) = schema.hook_chain(event) {
            run_hooks(&chain.pre, self).await?;
            run_hooks(&chain.post, self).await?;
        }
        Ok(())
    }

    /// Storage key, generating the key value first when the key field is
    /// unset and generation is on.
    pub(crate) fn ensure_key(&mut self) -> Result<String, OdmError> {
        let schema = self.schema_arc();
        let key_field = schema.key_field();
        let missing = self
            .raw(&key_field.name)
            .map(|v| v.is_null())
            .unwrap_or(true);
        if missing {
            if key_field.generates_key() {
                let id = Uuid::new_v4().to_string();
                self.set_raw(&key_field.name, Value::String(id));
            } else {
                return Err(OdmError::InvalidKey(format!(
                    "model {} document has no {} value",
                    self.model_name(),
                    key_field.name
                )));
            }
        }
        self.storage_key()
    }

    /// The value lookup documents reference: full storage key under
    /// `store_full_reference_id`, user-visible key otherwise.
    fn index_target(&self, storage_key: &str) -> Result<String, OdmError> {
        if self
            .schema()
            .store_full_reference_id(self.odm().config())
        {
            Ok(storage_key.to_string())
        } else {
            self.user_key()
        }
    }

    /// Slots currently holding hydrated embedded documents, in schema
    /// order; array slots enumerate left-to-right.
    pub(crate) fn embedded_slots(&self) -> Vec<(String, Option<usize>)> {
        let mut slots = Vec::new();
        for field in self.schema().fields() {
            match &field.kind {
                FieldKind::Ref(_) => {
                    if matches!(self.raw(&field.name), Some(Value::Doc(_))) {
                        slots.push((field.name.clone(), None));
                    }
                }
                FieldKind::Array(attrs)
                    if matches!(attrs.element.as_ref(), FieldKind::Ref(_)) =>
                {
                    if let Some(Value::Array(items)) = self.raw(&field.name) {
                        for (idx, item) in items.iter().enumerate() {
                            if matches!(item, Value::Doc(_)) {
                                slots.push((field.name.clone(), Some(idx)));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        slots
    }

    pub(crate) fn embedded_child(&mut self, field: &str, slot: Option<usize>) -> Option<&mut Document> {
        match slot {
            None => self.raw_mut(field).and_then(Value::as_doc_mut),
            Some(idx) => self.raw_mut(field).and_then(|value| match value {
                Value::Array(items) => items.get_mut(idx).and_then(Value::as_doc_mut),
                _ => None,
            }),
        }
    }

    fn report_post_hook_error(&self, event: &str, err: OdmError, config: &crate::config::OdmConfig) {
        tracing::warn!(model = %self.model_name(), event, error = %err, "post-hook failed");
        if config.emit_errors {
            self.emit(EventKind::Error, &[err]);
        }
    }
}
