//! Schema registry — compiles field descriptors into a normalized schema:
//! ordered field list, key and index handles, middleware chains, virtuals,
//! statics, and instance methods.

mod field;
mod hooks;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::OdmConfig;
use crate::document::Document;
use crate::error::OdmError;
use crate::key;
use crate::model::Model;
use crate::value::Value;

pub use field::{
    ArrayAttrs, DefaultSpec, DefaultThunk, FieldDescriptor, FieldKind, GetterFn, KeyAttrs,
    NumberAttrs, StringAttrs, StringTransformFn, TransformFn, ValidatorFn,
};
pub use hooks::{AsyncHookFn, BoxFuture, Hook, HookChain, SyncHookFn};

pub(crate) use hooks::run_hooks;

pub type StaticFn = Arc<dyn Fn(&Model, Value) -> Value + Send + Sync>;
pub type MethodFn = Arc<dyn Fn(&mut Document, Value) -> Value + Send + Sync>;
pub type ObjectTransformFn = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;
pub type ValueSetGuardFn = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;
pub type ValueSetNotifyFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// A computed member: exposed on reads, never persisted. An optional setter
/// makes it writable.
#[derive(Clone)]
pub struct Virtual {
    pub(crate) get: Arc<dyn Fn(&Document) -> Value + Send + Sync>,
    pub(crate) set: Option<Arc<dyn Fn(&mut Document, Value) + Send + Sync>>,
}

/// Schema-level options. Unset entries fall back to the [`OdmConfig`].
#[derive(Clone, Default)]
pub struct SchemaOptions {
    pub key_prefix: Option<String>,
    pub key_suffix: Option<String>,
    pub delimiter: Option<String>,
    pub ref_index_key_prefix: Option<String>,
    pub minimize: Option<bool>,
    pub store_full_reference_id: Option<bool>,
    pub store_full_key: Option<bool>,
    pub(crate) to_object: Option<ObjectTransformFn>,
    pub(crate) to_json: Option<ObjectTransformFn>,
    pub(crate) on_before_value_set: Option<ValueSetGuardFn>,
    pub(crate) on_value_set: Option<ValueSetNotifyFn>,
}

impl SchemaOptions {
    pub fn new() -> Self {
        SchemaOptions::default()
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn key_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.key_suffix = Some(suffix.into());
        self
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn ref_index_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ref_index_key_prefix = Some(prefix.into());
        self
    }

    pub fn minimize(mut self, on: bool) -> Self {
        self.minimize = Some(on);
        self
    }

    pub fn store_full_reference_id(mut self, on: bool) -> Self {
        self.store_full_reference_id = Some(on);
        self
    }

    pub fn store_full_key(mut self, on: bool) -> Self {
        self.store_full_key = Some(on);
        self
    }

    /// Default post-serialization mapper for `to_object`.
    pub fn to_object_transform(
        mut self,
        f: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.to_object = Some(Arc::new(f));
        self
    }

    /// Default post-serialization mapper for `to_json`.
    pub fn to_json_transform(
        mut self,
        f: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.to_json = Some(Arc::new(f));
        self
    }

    /// Guard consulted before each field commit; returning false cancels
    /// the write.
    pub fn on_before_value_set(
        mut self,
        f: impl Fn(&str, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_before_value_set = Some(Arc::new(f));
        self
    }

    /// Notification fired after each committed field write.
    pub fn on_value_set(mut self, f: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.on_value_set = Some(Arc::new(f));
        self
    }
}

/// A named collection of field descriptors plus schema-level options,
/// middleware, virtuals, statics, and instance methods.
#[derive(Clone, Default)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
    by_name: HashMap<String, usize>,
    key_field: Option<usize>,
    index_fields: Vec<usize>,
    pub options: SchemaOptions,
    hooks: HashMap<String, HookChain>,
    virtuals: HashMap<String, Virtual>,
    statics: HashMap<String, StaticFn>,
    methods: HashMap<String, MethodFn>,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    pub fn with_options(options: SchemaOptions) -> Self {
        Schema {
            options,
            ..Schema::default()
        }
    }

    /// Append a field, or override an existing one of the same name in
    /// place (order preserved).
    pub fn add(&mut self, field: FieldDescriptor) -> &mut Self {
        match self.by_name.get(&field.name) {
            Some(&idx) => self.fields[idx] = field,
            None => {
                self.by_name.insert(field.name.clone(), self.fields.len());
                self.fields.push(field);
            }
        }
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&idx| &self.fields[idx])
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Resolve a field name, following alias fields to their target.
    pub(crate) fn resolve(&self, name: &str) -> Option<&FieldDescriptor> {
        let mut field = self.field(name)?;
        let mut hops = 0;
        while let FieldKind::Alias(target) = &field.kind {
            hops += 1;
            if hops > self.fields.len() {
                return None;
            }
            field = self.field(target)?;
        }
        Some(field)
    }

    /// Register a sync pre-hook for `event` (`save`, `remove`, or a custom
    /// name).
    pub fn pre(
        &mut self,
        event: impl Into<String>,
        f: impl Fn(&mut Document) -> Result<(), OdmError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.hooks
            .entry(event.into())
            .or_default()
            .pre
            .push(Hook::Sync(Arc::new(f)));
        self
    }

    /// Register an async pre-hook: the returned future is the completion
    /// signal.
    pub fn pre_async(
        &mut self,
        event: impl Into<String>,
        f: impl for<'a> Fn(&'a mut Document) -> BoxFuture<'a, Result<(), OdmError>>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.hooks
            .entry(event.into())
            .or_default()
            .pre
            .push(Hook::Async(Arc::new(f)));
        self
    }

    /// Register a sync post-hook for `event`.
    pub fn post(
        &mut self,
        event: impl Into<String>,
        f: impl Fn(&mut Document) -> Result<(), OdmError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.hooks
            .entry(event.into())
            .or_default()
            .post
            .push(Hook::Sync(Arc::new(f)));
        self
    }

    /// Register an async post-hook for `event`.
    pub fn post_async(
        &mut self,
        event: impl Into<String>,
        f: impl for<'a> Fn(&'a mut Document) -> BoxFuture<'a, Result<(), OdmError>>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.hooks
            .entry(event.into())
            .or_default()
            .post
            .push(Hook::Async(Arc::new(f)));
        self
    }

    pub(crate) fn hook_chain(&self, event: &str) -> Option<&HookChain> {
        self.hooks.get(event)
    }

    /// Register a read-only virtual.
    pub fn virtual_get(
        &mut self,
        name: impl Into<String>,
        get: impl Fn(&Document) -> Value + Send + Sync + 'static,
    ) -> &mut Self {
        self.virtuals.insert(
            name.into(),
            Virtual {
                get: Arc::new(get),
                set: None,
            },
        );
        self
    }

    /// Register a virtual with a setter.
    pub fn virtual_get_set(
        &mut self,
        name: impl Into<String>,
        get: impl Fn(&Document) -> Value + Send + Sync + 'static,
        set: impl Fn(&mut Document, Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.virtuals.insert(
            name.into(),
            Virtual {
                get: Arc::new(get),
                set: Some(Arc::new(set)),
            },
        );
        self
    }

    pub(crate) fn virtual_member(&self, name: &str) -> Option<&Virtual> {
        self.virtuals.get(name)
    }

    pub(crate) fn virtuals(&self) -> impl Iterator<Item = (&String, &Virtual)> {
        self.virtuals.iter()
    }

    /// Register a model-level static.
    pub fn static_fn(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Model, Value) -> Value + Send + Sync + 'static,
    ) -> &mut Self {
        self.statics.insert(name.into(), Arc::new(f));
        self
    }

    pub(crate) fn static_member(&self, name: &str) -> Option<&StaticFn> {
        self.statics.get(name)
    }

    /// Register an instance method.
    pub fn method(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut Document, Value) -> Value + Send + Sync + 'static,
    ) -> &mut Self {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub(crate) fn method_member(&self, name: &str) -> Option<MethodFn> {
        self.methods.get(name).cloned()
    }

    /// Copy from `base` the fields, virtuals, statics, methods, and hook
    /// entries whose names are absent here (shallow diff by name).
    pub fn extend(&mut self, base: &Schema) -> &mut Self {
        for field in &base.fields {
            if !self.by_name.contains_key(&field.name) {
                self.add(field.clone());
            }
        }
        for (name, virt) in &base.virtuals {
            self.virtuals
                .entry(name.clone())
                .or_insert_with(|| virt.clone());
        }
        for (name, f) in &base.statics {
            self.statics.entry(name.clone()).or_insert_with(|| f.clone());
        }
        for (name, f) in &base.methods {
            self.methods.entry(name.clone()).or_insert_with(|| f.clone());
        }
        for (event, chain) in &base.hooks {
            self.hooks
                .entry(event.clone())
                .or_insert_with(|| chain.clone());
        }
        self
    }

    /// Normalize the schema for a model: resolve the key field (injecting a
    /// generated `id` when none is declared) and the index handles.
    ///
    /// Panics when more than one field carries key attributes — that is a
    /// definition error, not a runtime condition.
    pub(crate) fn compile(&mut self, model_name: &str) {
        let keyed: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_key())
            .map(|(idx, _)| idx)
            .collect();
        let key_field = match keyed.len() {
            0 => {
                match self.by_name.get("id").copied() {
                    Some(idx) => {
                        let existing =
                            std::mem::replace(&mut self.fields[idx], FieldDescriptor::string("id"));
                        self.fields[idx] = existing.key();
                        idx
                    }
                    None => {
                        self.add(FieldDescriptor::string("id").key());
                        self.fields.len() - 1
                    }
                }
            }
            1 => keyed[0],
            _ => panic!("model {:?} declares more than one key field", model_name),
        };
        self.key_field = Some(key_field);

        self.index_fields.clear();
        for idx in 0..self.fields.len() {
            if self.fields[idx].index {
                if self.fields[idx].index_name.is_none() {
                    self.fields[idx].index_name =
                        Some(key::derive_index_name(&self.fields[idx].name));
                }
                self.index_fields.push(idx);
            }
        }
    }

    /// The key field. Only valid after [`Schema::compile`].
    pub(crate) fn key_field(&self) -> &FieldDescriptor {
        let idx = self.key_field.expect("schema not compiled");
        &self.fields[idx]
    }

    pub(crate) fn index_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.index_fields.iter().map(|&idx| &self.fields[idx])
    }

    pub(crate) fn key_prefix<'a>(&'a self, config: &'a OdmConfig) -> &'a str {
        self.options
            .key_prefix
            .as_deref()
            .unwrap_or(&config.key_prefix)
    }

    pub(crate) fn key_suffix<'a>(&'a self, config: &'a OdmConfig) -> &'a str {
        self.options
            .key_suffix
            .as_deref()
            .unwrap_or(&config.key_suffix)
    }

    pub(crate) fn delimiter<'a>(&'a self, config: &'a OdmConfig) -> &'a str {
        self.options
            .delimiter
            .as_deref()
            .unwrap_or(&config.delimiter)
    }

    pub(crate) fn ref_index_key_prefix<'a>(&'a self, config: &'a OdmConfig) -> &'a str {
        self.options
            .ref_index_key_prefix
            .as_deref()
            .unwrap_or(&config.ref_index_key_prefix)
    }

    pub(crate) fn minimize(&self, config: &OdmConfig) -> bool {
        self.options.minimize.unwrap_or(config.minimize)
    }

    pub(crate) fn store_full_reference_id(&self, config: &OdmConfig) -> bool {
        self.options
            .store_full_reference_id
            .unwrap_or(config.store_full_reference_id)
    }

    pub(crate) fn store_full_key(&self, config: &OdmConfig) -> bool {
        self.options.store_full_key.unwrap_or(config.store_full_key)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("virtuals", &self.virtuals.keys())
            .field("hooks", &self.hooks.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_appends_and_overrides() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("name"));
        schema.add(FieldDescriptor::number("age"));
        schema.add(FieldDescriptor::string("name").read_only());
        assert_eq!(schema.fields().len(), 2);
        assert_eq!(schema.fields()[0].name, "name");
        assert!(schema.field("name").unwrap().read_only);
    }

    #[test]
    fn compile_injects_synthetic_id() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("name"));
        schema.compile("User");
        let key = schema.key_field();
        assert_eq!(key.name, "id");
        assert!(key.generates_key());
    }

    #[test]
    fn compile_keeps_declared_key() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("email").key().no_generate());
        schema.compile("User");
        let key = schema.key_field();
        assert_eq!(key.name, "email");
        assert!(!key.generates_key());
    }

    #[test]
    #[should_panic(expected = "more than one key field")]
    fn compile_rejects_two_keys() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("a").key());
        schema.add(FieldDescriptor::string("b").key());
        schema.compile("Broken");
    }

    #[test]
    fn compile_fills_index_names() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("email").index());
        schema.add(FieldDescriptor::array("user_names", FieldKind::string()).index());
        schema.add(FieldDescriptor::string("ssn").index_named("socialSecurity"));
        schema.compile("User");
        let names: Vec<_> = schema
            .index_fields()
            .map(|f| f.index_name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["email", "userName", "socialSecurity"]);
    }

    #[test]
    fn alias_resolution() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("username"));
        schema.add(FieldDescriptor::alias("login", "username"));
        assert_eq!(schema.resolve("login").unwrap().name, "username");
        assert!(schema.resolve("missing").is_none());
    }

    #[test]
    fn alias_cycle_resolves_to_none() {
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::alias("a", "b"));
        schema.add(FieldDescriptor::alias("b", "a"));
        assert!(schema.resolve("a").is_none());
    }

    #[test]
    fn extend_copies_absent_names_only() {
        let mut base = Schema::new();
        base.add(FieldDescriptor::string("name"));
        base.add(FieldDescriptor::number("age").min(0.0));
        base.virtual_get("display", |_| Value::from("base"));
        base.pre("save", |_| Ok(()));

        let mut extended = Schema::new();
        extended.add(FieldDescriptor::string("name").read_only());
        extended.virtual_get("display", |_| Value::from("extended"));
        extended.extend(&base);

        // own name field wins, base age field is copied
        assert!(extended.field("name").unwrap().read_only);
        assert!(extended.field("age").is_some());
        assert!(extended.virtual_member("display").is_some());
        assert_eq!(extended.hook_chain("save").unwrap().pre.len(), 1);
    }

    #[test]
    fn options_fall_back_to_config() {
        let config = OdmConfig::new().with_key_prefix("cfg::").with_delimiter("|");
        let schema = Schema::with_options(SchemaOptions::new().key_prefix("schema::"));
        assert_eq!(schema.key_prefix(&config), "schema::");
        assert_eq!(schema.delimiter(&config), "|");
        assert!(schema.minimize(&config));
    }
}
