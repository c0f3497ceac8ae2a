//! Document instances — a schema-validated property bag plus the engine
//! state that ties it to the store: CAS token, lifecycle flag, accumulated
//! set-errors, index shadow, and the event registry.

mod emitter;
mod engine;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::OdmError;
use crate::key;
use crate::odm::Odm;
use crate::schema::{DefaultSpec, FieldDescriptor, FieldKind, ObjectTransformFn, Schema};
use crate::store::Cas;
use crate::value::Value;

pub use emitter::{DocumentEmitter, Event, EventKind};
pub use engine::{RemoveOptions, SaveOptions};

/// A rejected field write. Accumulated on the instance, never thrown.
#[derive(Clone, Debug)]
pub struct SetError {
    pub field: String,
    pub message: String,
    pub attempted: Option<Value>,
    pub previous: Option<Value>,
}

/// Options for [`Document::to_object`].
#[derive(Clone, Default)]
pub struct ToObjectOptions {
    /// Post-serialization mapper; runs after minimization and virtuals.
    pub transform: Option<ObjectTransformFn>,
    /// Drop empty objects and arrays. Defaults to the schema/config setting.
    pub minimize: Option<bool>,
    /// Include computed virtuals.
    pub virtuals: bool,
    /// Serialize dates as ISO-8601 strings instead of epoch milliseconds.
    pub date_to_iso: bool,
}

/// A mutable, schema-validated document bound to a model.
pub struct Document {
    model: String,
    schema: Arc<Schema>,
    odm: Odm,
    values: HashMap<String, Value>,
    cas: Option<Cas>,
    persisted: bool,
    set_errors: Vec<SetError>,
    /// Indexed values as of the last load or save, per index name.
    shadow: HashMap<String, BTreeSet<String>>,
    emitter: DocumentEmitter,
}

impl Document {
    pub(crate) fn new(model: String, schema: Arc<Schema>, odm: Odm) -> Self {
        Document {
            model,
            schema,
            odm,
            values: HashMap::new(),
            cas: None,
            persisted: false,
            set_errors: Vec::new(),
            shadow: HashMap::new(),
            emitter: DocumentEmitter::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn schema_arc(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub(crate) fn odm(&self) -> &Odm {
        &self.odm
    }

    /// The CAS token from the last store round-trip, if any.
    pub fn cas(&self) -> Option<Cas> {
        self.cas
    }

    pub(crate) fn set_cas(&mut self, cas: Cas) {
        self.cas = Some(cas);
    }

    /// A document is new until its first successful save.
    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub(crate) fn detach(&mut self) {
        self.persisted = false;
        self.cas = None;
    }

    /// Committed value of the key field.
    pub fn key_value(&self) -> Option<&Value> {
        let field = self.schema.key_field();
        self.values.get(&field.name).filter(|v| !v.is_null())
    }

    /// User-visible key as its canonical string form.
    pub fn user_key(&self) -> Result<String, OdmError> {
        let value = self.key_value().ok_or_else(|| self.missing_key_error())?;
        key::stringify(value)
    }

    /// Full storage key for this document.
    pub fn storage_key(&self) -> Result<String, OdmError> {
        let field = self.schema.key_field();
        let value = self.key_value().ok_or_else(|| self.missing_key_error())?;
        key::storage_key(value, field, &self.schema, self.odm.config())
    }

    fn missing_key_error(&self) -> OdmError {
        OdmError::InvalidKey(format!(
            "model {} document has no {} value",
            self.model,
            self.schema.key_field().name
        ))
    }

    /// Read a field or virtual. Aliases resolve to their target; field
    /// getters apply.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(virt) = self.schema.virtual_member(name) {
            return Some((virt.get)(self));
        }
        let field = self.schema.resolve(name)?;
        let raw = self.values.get(&field.name)?;
        match &field.getter {
            Some(getter) => Some(getter(raw)),
            None => Some(raw.clone()),
        }
    }

    pub fn get_many(&self, names: &[&str]) -> Vec<Option<Value>> {
        names.iter().map(|name| self.get(name)).collect()
    }

    /// Raw committed value, no getter, no virtuals.
    pub(crate) fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub(crate) fn raw_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.values.get_mut(name)
    }

    /// Write a field through the full pipeline: transform, typecast,
    /// validator, `on_before_value_set`, commit, `on_value_set`. A rejection
    /// at any step skips the commit and appends a [`SetError`].
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.set_value(name, value.into());
    }

    pub fn set_many<N, V>(&mut self, entries: impl IntoIterator<Item = (N, V)>)
    where
        N: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in entries {
            self.set_value(name.as_ref(), value.into());
        }
    }

    fn set_value(&mut self, name: &str, value: Value) {
        let schema = Arc::clone(&self.schema);
        if let Some(virt) = schema.virtual_member(name) {
            match &virt.set {
                Some(setter) => setter(self, value),
                None => self.record_error(name, "virtual has no setter", Some(value), None),
            }
            return;
        }
        let Some(field) = schema.resolve(name) else {
            self.record_error(name, "unknown field", Some(value), None);
            return;
        };
        if field.read_only {
            let previous = self.values.get(&field.name).cloned();
            self.record_error(&field.name, "field is read-only", Some(value), previous);
            return;
        }
        let previous = self.values.get(&field.name).cloned();
        let attempted = value.clone();

        let mut pending = value;
        if let Some(transform) = &field.transform {
            pending = transform(pending);
        }
        let cast = match field.kind.typecast(pending) {
            Ok(cast) => cast,
            Err(message) => {
                self.record_error(&field.name, message, Some(attempted), previous);
                return;
            }
        };
        if let Some(validator) = &field.validator {
            if !validator(&cast) {
                self.record_error(&field.name, "validation failed", Some(attempted), previous);
                return;
            }
        }
        if let Some(guard) = &schema.options.on_before_value_set {
            if !guard(&field.name, &cast) {
                self.record_error(
                    &field.name,
                    "write canceled by on_before_value_set",
                    Some(attempted),
                    previous,
                );
                return;
            }
        }
        self.values.insert(field.name.clone(), cast.clone());
        if let Some(notify) = &schema.options.on_value_set {
            notify(&field.name, &cast);
        }
    }

    /// Hydration-mode write: no validators, no transforms, no read-only
    /// rejection. Typecast is best-effort so persisted data always loads.
    pub(crate) fn set_raw(&mut self, name: &str, value: Value) {
        let schema = Arc::clone(&self.schema);
        let Some(field) = schema.resolve(name) else {
            return;
        };
        let cast = field
            .kind
            .typecast(value.clone())
            .unwrap_or(value);
        self.values.insert(field.name.clone(), cast);
    }

    pub(crate) fn apply_defaults(&mut self) {
        let schema = Arc::clone(&self.schema);
        for field in schema.fields() {
            if self.values.contains_key(&field.name) {
                continue;
            }
            let Some(default) = &field.default else {
                continue;
            };
            let value = match default {
                DefaultSpec::Value(v) => v.clone(),
                DefaultSpec::Thunk(thunk) => thunk(self),
            };
            if !value.is_null() {
                self.set_raw(&field.name, value);
            }
        }
    }

    fn record_error(
        &mut self,
        field: &str,
        message: impl Into<String>,
        attempted: Option<Value>,
        previous: Option<Value>,
    ) {
        let message = message.into();
        tracing::debug!(model = %self.model, field, %message, "field write rejected");
        self.set_errors.push(SetError {
            field: field.to_string(),
            message,
            attempted,
            previous,
        });
    }

    /// Accumulated write rejections.
    pub fn errors(&self) -> &[SetError] {
        &self.set_errors
    }

    pub fn has_errors(&self) -> bool {
        !self.set_errors.is_empty()
    }

    pub fn clear_errors(&mut self) {
        self.set_errors.clear();
    }

    /// Register a lifecycle listener.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        self.emitter.on(kind, listener);
    }

    pub(crate) fn emit(&self, kind: EventKind, errors: &[OdmError]) {
        let emitter = self.emitter.clone();
        emitter.emit(kind, self, errors);
    }

    /// Call a schema-registered instance method.
    pub fn call(&mut self, name: &str, args: Value) -> Option<Value> {
        let method = self.schema.method_member(name)?;
        Some(method(self, args))
    }

    /// Plain-object serialization. Order: field map, virtuals,
    /// minimization, transform.
    pub fn to_object(&self, options: &ToObjectOptions) -> serde_json::Value {
        let transform = options
            .transform
            .clone()
            .or_else(|| self.schema.options.to_object.clone());
        self.render(options, transform)
    }

    /// Like [`Document::to_object`] with ISO dates and the schema's
    /// `to_json` transform.
    pub fn to_json(&self) -> serde_json::Value {
        let options = ToObjectOptions {
            date_to_iso: true,
            ..ToObjectOptions::default()
        };
        let transform = self.schema.options.to_json.clone();
        self.render(&options, transform)
    }

    fn render(
        &self,
        options: &ToObjectOptions,
        transform: Option<ObjectTransformFn>,
    ) -> serde_json::Value {
        let minimize = options
            .minimize
            .unwrap_or_else(|| self.schema.minimize(self.odm.config()));
        let mut map = serde_json::Map::new();
        for field in self.schema.fields() {
            if field.invisible || matches!(field.kind, FieldKind::Alias(_)) {
                continue;
            }
            let Some(value) = self.values.get(&field.name) else {
                continue;
            };
            map.insert(field.name.clone(), self.json_of(value, options));
        }
        if options.virtuals {
            for (name, virt) in self.schema.virtuals() {
                map.insert(name.clone(), self.json_of(&(virt.get)(self), options));
            }
        }
        let mut json = serde_json::Value::Object(map);
        if minimize {
            minimize_json(&mut json);
        }
        match transform {
            Some(transform) => transform(json),
            None => json,
        }
    }

    fn json_of(&self, value: &Value, options: &ToObjectOptions) -> serde_json::Value {
        match value {
            Value::Doc(doc) => doc.to_object(&ToObjectOptions {
                transform: None,
                minimize: options.minimize,
                virtuals: options.virtuals,
                date_to_iso: options.date_to_iso,
            }),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(|item| self.json_of(item, options)).collect(),
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.json_of(v, options)))
                    .collect(),
            ),
            other => other.to_json(options.date_to_iso),
        }
    }

    /// Persisted representation: embedded documents and reference scalars
    /// fold to key scalars; the key field stores its user value (or the
    /// full storage key under `store_full_key`).
    pub(crate) fn to_stored(
        &self,
        virtuals: bool,
        minimize: Option<bool>,
    ) -> Result<serde_json::Value, OdmError> {
        let config = self.odm.config();
        let minimize = minimize.unwrap_or_else(|| self.schema.minimize(config));
        let full_ref = self.schema.store_full_reference_id(config);
        let plain = ToObjectOptions::default();

        let mut map = serde_json::Map::new();
        for field in self.schema.fields() {
            if field.invisible || matches!(field.kind, FieldKind::Alias(_)) {
                continue;
            }
            let Some(value) = self.values.get(&field.name) else {
                continue;
            };
            let json = if field.is_key() && self.schema.store_full_key(config) {
                serde_json::Value::String(self.storage_key()?)
            } else {
                self.stored_json_of(field, value, full_ref)?
            };
            map.insert(field.name.clone(), json);
        }
        if virtuals {
            for (name, virt) in self.schema.virtuals() {
                map.insert(name.clone(), self.json_of(&(virt.get)(self), &plain));
            }
        }
        let mut json = serde_json::Value::Object(map);
        if minimize {
            minimize_json(&mut json);
        }
        if let Some(transform) = &self.schema.options.to_object {
            json = transform(json);
        }
        Ok(json)
    }

    fn stored_json_of(
        &self,
        field: &FieldDescriptor,
        value: &Value,
        full_ref: bool,
    ) -> Result<serde_json::Value, OdmError> {
        match (&field.kind, value) {
            (FieldKind::Ref(model), _) => self.stored_ref_json(model, value, full_ref),
            (FieldKind::Array(attrs), Value::Array(items)) => {
                if let FieldKind::Ref(model) = attrs.element.as_ref() {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.stored_ref_json(model, item, full_ref)?);
                    }
                    Ok(serde_json::Value::Array(out))
                } else {
                    Ok(self.json_of(value, &ToObjectOptions::default()))
                }
            }
            _ => Ok(self.json_of(value, &ToObjectOptions::default())),
        }
    }

    fn stored_ref_json(
        &self,
        model: &str,
        value: &Value,
        full_ref: bool,
    ) -> Result<serde_json::Value, OdmError> {
        match value {
            Value::Doc(doc) => {
                if full_ref {
                    Ok(serde_json::Value::String(doc.storage_key()?))
                } else {
                    let key = doc
                        .key_value()
                        .ok_or_else(|| doc.missing_key_error())?;
                    Ok(key.to_json(false))
                }
            }
            Value::String(_) | Value::Number(_) => {
                if full_ref {
                    match self.odm.schema_for(model) {
                        Some(target) => {
                            let storage = key::storage_key(
                                value,
                                target.key_field(),
                                &target,
                                self.odm.config(),
                            )?;
                            Ok(serde_json::Value::String(storage))
                        }
                        None => {
                            tracing::warn!(model, "reference target model not registered");
                            Ok(value.to_json(false))
                        }
                    }
                } else {
                    Ok(value.to_json(false))
                }
            }
            Value::Null => Ok(serde_json::Value::Null),
            other => Err(OdmError::Serialization(format!(
                "reference field holds a {} value",
                other.type_name()
            ))),
        }
    }

    /// Current values of indexed fields, per index name, as canonical
    /// strings. Arrays expand element-wise; hydrated references contribute
    /// their key.
    pub(crate) fn current_index_values(&self) -> HashMap<String, BTreeSet<String>> {
        let mut out = HashMap::new();
        for field in self.schema.index_fields() {
            let name = field.index_name.clone().expect("schema not compiled");
            let mut set = BTreeSet::new();
            if let Some(value) = self.values.get(&field.name) {
                collect_index_strings(value, &mut set);
            }
            out.insert(name, set);
        }
        out
    }

    /// Reference slots currently holding key scalars instead of hydrated
    /// documents: `(field, array index, target model, user key)`.
    pub(crate) fn scalar_ref_slots(&self) -> Vec<(String, Option<usize>, String, String)> {
        let mut slots = Vec::new();
        for field in self.schema.fields() {
            match &field.kind {
                FieldKind::Ref(model) => {
                    if let Some(value) = self.values.get(&field.name) {
                        if let Ok(user_key) = key::stringify(value) {
                            slots.push((field.name.clone(), None, model.clone(), user_key));
                        }
                    }
                }
                FieldKind::Array(attrs) => {
                    if let FieldKind::Ref(model) = attrs.element.as_ref() {
                        if let Some(Value::Array(items)) = self.values.get(&field.name) {
                            for (idx, item) in items.iter().enumerate() {
                                if let Ok(user_key) = key::stringify(item) {
                                    slots.push((
                                        field.name.clone(),
                                        Some(idx),
                                        model.clone(),
                                        user_key,
                                    ));
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        slots
    }

    pub(crate) fn shadow(&self) -> &HashMap<String, BTreeSet<String>> {
        &self.shadow
    }

    /// Snapshot current indexed values as the new shadow.
    pub(crate) fn refresh_shadow(&mut self) {
        self.shadow = self.current_index_values();
    }

    pub(crate) fn clear_shadow(&mut self) {
        self.shadow.clear();
    }
}

impl Clone for Document {
    fn clone(&self) -> Self {
        Document {
            model: self.model.clone(),
            schema: Arc::clone(&self.schema),
            odm: self.odm.clone(),
            values: self.values.clone(),
            cas: self.cas,
            persisted: self.persisted,
            set_errors: self.set_errors.clone(),
            shadow: self.shadow.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("model", &self.model)
            .field("values", &self.values)
            .field("cas", &self.cas)
            .field("persisted", &self.persisted)
            .field("errors", &self.set_errors.len())
            .finish()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Document) -> bool {
        self.model == other.model && self.values == other.values
    }
}

fn collect_index_strings(value: &Value, set: &mut BTreeSet<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                if let Some(s) = index_string(item) {
                    set.insert(s);
                }
            }
        }
        other => {
            if let Some(s) = index_string(other) {
                set.insert(s);
            }
        }
    }
}

/// Canonical index string for one value. Containers do not index.
fn index_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(key::format_number(*n)),
        Value::Bool(b) => Some(b.to_string()),
        Value::Date(d) => Some(d.to_rfc3339()),
        Value::Doc(doc) => doc
            .key_value()
            .and_then(|k| key::stringify(k).ok()),
        _ => None,
    }
}

/// Recursively drop empty objects and arrays (the top level stays).
fn minimize_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for child in map.values_mut() {
                minimize_json(child);
            }
            map.retain(|_, v| !is_empty_container(v));
        }
        serde_json::Value::Array(items) => {
            for child in items.iter_mut() {
                minimize_json(child);
            }
        }
        _ => {}
    }
}

fn is_empty_container(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
