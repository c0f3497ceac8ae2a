use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use crate::document::Document;
use crate::key;
use crate::schema::Schema;
use crate::value::Value;

pub type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type ValidatorFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type GetterFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type StringTransformFn = Arc<dyn Fn(String) -> String + Send + Sync>;
pub type DefaultThunk = Arc<dyn Fn(&Document) -> Value + Send + Sync>;

/// Field default: a fixed value or a thunk evaluated in document context.
#[derive(Clone)]
pub enum DefaultSpec {
    Value(Value),
    Thunk(DefaultThunk),
}

impl fmt::Debug for DefaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultSpec::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DefaultSpec::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

#[derive(Clone, Default)]
pub struct StringAttrs {
    pub regex: Option<Regex>,
    pub enum_values: Option<Vec<String>>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    /// Truncate at `max_length` instead of rejecting.
    pub clip: bool,
    pub transform: Option<StringTransformFn>,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct NumberAttrs {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Clone)]
pub struct ArrayAttrs {
    /// Drop duplicate elements, keeping the first occurrence.
    pub unique: bool,
    pub element: Box<FieldKind>,
}

/// Key-field attributes. `generate` defaults to true: an unset key value is
/// filled with a v4 UUID at save time.
#[derive(Clone, Debug, Default)]
pub struct KeyAttrs {
    pub generate: bool,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

/// Semantic type of a field, with per-variant constraints.
#[derive(Clone)]
pub enum FieldKind {
    String(StringAttrs),
    Number(NumberAttrs),
    Boolean,
    Date,
    Any,
    Array(ArrayAttrs),
    Object(Arc<Schema>),
    /// Reference to another model by name; holds a hydrated document or a
    /// key scalar.
    Ref(String),
    /// Reads and writes pass through to the named field.
    Alias(String),
}

impl FieldKind {
    pub fn string() -> FieldKind {
        FieldKind::String(StringAttrs::default())
    }

    pub fn number() -> FieldKind {
        FieldKind::Number(NumberAttrs::default())
    }

    pub fn boolean() -> FieldKind {
        FieldKind::Boolean
    }

    pub fn date() -> FieldKind {
        FieldKind::Date
    }

    pub fn any() -> FieldKind {
        FieldKind::Any
    }

    pub fn reference(model: impl Into<String>) -> FieldKind {
        FieldKind::Ref(model.into())
    }

    /// Coerce `value` to this kind when safely possible. Unsafe coercions
    /// return `Err` with the rejection message; the prior value stays put.
    /// `Null` passes every kind (it clears the field).
    pub(crate) fn typecast(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            FieldKind::Any | FieldKind::Alias(_) => Ok(value),
            FieldKind::String(attrs) => cast_string(attrs, value),
            FieldKind::Number(attrs) => cast_number(attrs, value),
            FieldKind::Boolean => cast_boolean(value),
            FieldKind::Date => cast_date(value),
            FieldKind::Array(attrs) => cast_array(attrs, value),
            FieldKind::Object(schema) => cast_object(schema, value),
            FieldKind::Ref(_) => match value {
                Value::Doc(_) | Value::String(_) | Value::Number(_) => Ok(value),
                other => Err(format!(
                    "expected a document or key scalar, got {}",
                    other.type_name()
                )),
            },
        }
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String(_) => f.write_str("String"),
            FieldKind::Number(attrs) => f.debug_tuple("Number").field(attrs).finish(),
            FieldKind::Boolean => f.write_str("Boolean"),
            FieldKind::Date => f.write_str("Date"),
            FieldKind::Any => f.write_str("Any"),
            FieldKind::Array(_) => f.write_str("Array"),
            FieldKind::Object(_) => f.write_str("Object"),
            FieldKind::Ref(model) => f.debug_tuple("Ref").field(model).finish(),
            FieldKind::Alias(target) => f.debug_tuple("Alias").field(target).finish(),
        }
    }
}

fn cast_string(attrs: &StringAttrs, value: Value) -> Result<Value, String> {
    let mut s = match value {
        Value::String(s) => s,
        Value::Number(n) => key::format_number(n),
        Value::Bool(b) => b.to_string(),
        Value::Date(d) => d.to_rfc3339(),
        other => return Err(format!("cannot cast {} to string", other.type_name())),
    };
    if let Some(transform) = &attrs.transform {
        s = transform(s);
    }
    if let Some(max) = attrs.max_length {
        if s.chars().count() > max {
            if attrs.clip {
                s = s.chars().take(max).collect();
            } else {
                return Err(format!("string longer than {} characters", max));
            }
        }
    }
    if let Some(min) = attrs.min_length {
        if s.chars().count() < min {
            return Err(format!("string shorter than {} characters", min));
        }
    }
    if let Some(regex) = &attrs.regex {
        if !regex.is_match(&s) {
            return Err(format!("string does not match /{}/", regex.as_str()));
        }
    }
    if let Some(allowed) = &attrs.enum_values {
        if !allowed.iter().any(|candidate| candidate == &s) {
            return Err(format!("{:?} is not an allowed value", s));
        }
    }
    Ok(Value::String(s))
}

fn cast_number(attrs: &NumberAttrs, value: Value) -> Result<Value, String> {
    let n = match value {
        Value::Number(n) => n,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{:?} is not numeric", s))?,
        other => return Err(format!("cannot cast {} to number", other.type_name())),
    };
    if let Some(min) = attrs.min {
        if n < min {
            return Err(format!("{} is below the minimum {}", n, min));
        }
    }
    if let Some(max) = attrs.max {
        if n > max {
            return Err(format!("{} is above the maximum {}", n, max));
        }
    }
    Ok(Value::Number(n))
}

fn cast_boolean(value: Value) -> Result<Value, String> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(b)),
        Value::Number(n) if n == 1.0 => Ok(Value::Bool(true)),
        Value::Number(n) if n == 0.0 => Ok(Value::Bool(false)),
        Value::String(s) if s == "true" || s == "1" => Ok(Value::Bool(true)),
        Value::String(s) if s == "false" || s == "0" => Ok(Value::Bool(false)),
        other => Err(format!("cannot cast {} to boolean", other.type_name())),
    }
}

fn cast_date(value: Value) -> Result<Value, String> {
    match value {
        Value::Date(d) => Ok(Value::Date(d)),
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Value::Date(d.with_timezone(&Utc)))
            .map_err(|_| format!("{:?} is not an ISO-8601 date", s)),
        Value::Number(n) => epoch_to_date(n)
            .map(Value::Date)
            .ok_or_else(|| format!("{} is not a valid epoch timestamp", n)),
        other => Err(format!("cannot cast {} to date", other.type_name())),
    }
}

/// Epoch numbers below 10^12 in magnitude read as seconds, larger ones as
/// milliseconds — covers both common encodings.
fn epoch_to_date(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() {
        return None;
    }
    let millis = if n.abs() < 1e12 {
        (n * 1000.0) as i64
    } else {
        n as i64
    };
    Utc.timestamp_millis_opt(millis).single()
}

fn cast_array(attrs: &ArrayAttrs, value: Value) -> Result<Value, String> {
    let items = match value {
        Value::Array(items) => items,
        other => return Err(format!("cannot cast {} to array", other.type_name())),
    };
    let mut cast = Vec::with_capacity(items.len());
    for item in items {
        let item = attrs.element.typecast(item)?;
        if attrs.unique && cast.contains(&item) {
            continue;
        }
        cast.push(item);
    }
    Ok(Value::Array(cast))
}

/// Sub-schema objects keep only declared fields, each cast by its own
/// descriptor.
fn cast_object(schema: &Schema, value: Value) -> Result<Value, String> {
    let map = match value {
        Value::Object(map) => map,
        other => return Err(format!("cannot cast {} to object", other.type_name())),
    };
    let mut cast = std::collections::BTreeMap::new();
    for (name, item) in map {
        if let Some(field) = schema.field(&name) {
            cast.insert(name, field.kind.typecast(item)?);
        }
    }
    Ok(Value::Object(cast))
}

/// A single compiled field: semantic type plus write-pipeline attributes.
#[derive(Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub default: Option<DefaultSpec>,
    /// Runs before typecast.
    pub transform: Option<TransformFn>,
    /// Runs after typecast; returning false cancels the write.
    pub validator: Option<ValidatorFn>,
    /// Applied on reads.
    pub getter: Option<GetterFn>,
    pub read_only: bool,
    pub invisible: bool,
    pub index: bool,
    pub index_name: Option<String>,
    pub key: Option<KeyAttrs>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldDescriptor {
            name: name.into(),
            kind,
            default: None,
            transform: None,
            validator: None,
            getter: None,
            read_only: false,
            invisible: false,
            index: false,
            index_name: None,
            key: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::string())
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::number())
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::boolean())
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::date())
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::any())
    }

    pub fn array(name: impl Into<String>, element: FieldKind) -> Self {
        Self::new(
            name,
            FieldKind::Array(ArrayAttrs {
                unique: false,
                element: Box::new(element),
            }),
        )
    }

    pub fn object(name: impl Into<String>, schema: Schema) -> Self {
        Self::new(name, FieldKind::Object(Arc::new(schema)))
    }

    pub fn reference(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Ref(model.into()))
    }

    pub fn alias(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Alias(target.into()))
    }

    /// Mark this field as the document key. Generation defaults on.
    pub fn key(mut self) -> Self {
        self.key.get_or_insert_with(|| KeyAttrs {
            generate: true,
            prefix: None,
            suffix: None,
        });
        self
    }

    /// Key fields only: do not auto-generate a missing value.
    pub fn no_generate(mut self) -> Self {
        self.key
            .get_or_insert_with(|| KeyAttrs {
                generate: true,
                prefix: None,
                suffix: None,
            })
            .generate = false;
        self
    }

    /// Key fields only: override the schema key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key
            .get_or_insert_with(|| KeyAttrs {
                generate: true,
                prefix: None,
                suffix: None,
            })
            .prefix = Some(prefix.into());
        self
    }

    /// Key fields only: override the schema key suffix.
    pub fn key_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.key
            .get_or_insert_with(|| KeyAttrs {
                generate: true,
                prefix: None,
                suffix: None,
            })
            .suffix = Some(suffix.into());
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn index_named(mut self, name: impl Into<String>) -> Self {
        self.index = true;
        self.index_name = Some(name.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn invisible(mut self) -> Self {
        self.invisible = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultSpec::Value(value.into()));
        self
    }

    pub fn default_fn(
        mut self,
        thunk: impl Fn(&Document) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.default = Some(DefaultSpec::Thunk(Arc::new(thunk)));
        self
    }

    pub fn transform(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn validate(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn getter(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.getter = Some(Arc::new(f));
        self
    }

    fn string_attrs(&mut self) -> &mut StringAttrs {
        match &mut self.kind {
            FieldKind::String(attrs) => attrs,
            _ => panic!("field {:?} is not a string field", self.name),
        }
    }

    fn number_attrs(&mut self) -> &mut NumberAttrs {
        match &mut self.kind {
            FieldKind::Number(attrs) => attrs,
            _ => panic!("field {:?} is not a number field", self.name),
        }
    }

    pub fn regex(mut self, pattern: &str) -> Self {
        self.string_attrs().regex =
            Some(Regex::new(pattern).expect("invalid field regex pattern"));
        self
    }

    pub fn one_of<S: Into<String>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.string_attrs().enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_length(mut self, n: usize) -> Self {
        self.string_attrs().min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.string_attrs().max_length = Some(n);
        self
    }

    pub fn clip(mut self) -> Self {
        self.string_attrs().clip = true;
        self
    }

    pub fn string_transform(
        mut self,
        f: impl Fn(String) -> String + Send + Sync + 'static,
    ) -> Self {
        self.string_attrs().transform = Some(Arc::new(f));
        self
    }

    pub fn min(mut self, n: f64) -> Self {
        self.number_attrs().min = Some(n);
        self
    }

    pub fn max(mut self, n: f64) -> Self {
        self.number_attrs().max = Some(n);
        self
    }

    pub fn unique(mut self) -> Self {
        match &mut self.kind {
            FieldKind::Array(attrs) => attrs.unique = true,
            _ => panic!("field {:?} is not an array field", self.name),
        }
        self
    }

    pub fn is_key(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn generates_key(&self) -> bool {
        self.key.as_ref().map(|k| k.generate).unwrap_or(false)
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("read_only", &self.read_only)
            .field("invisible", &self.invisible)
            .field("index", &self.index)
            .field("key", &self.key)
            .finish()
    }
}
