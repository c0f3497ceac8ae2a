//! Key codec — bidirectional mapping between user-visible key values and
//! storage keys, plus lookup-document key derivation.

use crate::config::OdmConfig;
use crate::error::OdmError;
use crate::schema::{FieldDescriptor, Schema};
use crate::value::Value;

/// Render a key value as its canonical string form. Only strings and
/// numbers can carry keys; numbers render base-10.
pub(crate) fn stringify(value: &Value) -> Result<String, OdmError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(format_number(*n)),
        other => Err(OdmError::InvalidKey(format!(
            "cannot derive a key from a {} value",
            other.type_name()
        ))),
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Derive the storage key for a user-visible key value. Field-level
/// prefix/suffix override the schema's, which override the config's.
pub(crate) fn storage_key(
    user_value: &Value,
    field: &FieldDescriptor,
    schema: &Schema,
    config: &OdmConfig,
) -> Result<String, OdmError> {
    let raw = stringify(user_value)?;
    let delimiter = schema.delimiter(config);
    if !delimiter.is_empty() && raw.contains(delimiter) {
        return Err(OdmError::InvalidKey(format!(
            "key value {:?} contains the delimiter {:?}",
            raw, delimiter
        )));
    }
    let attrs = field.key.as_ref();
    let prefix = attrs
        .and_then(|k| k.prefix.as_deref())
        .unwrap_or_else(|| schema.key_prefix(config));
    let suffix = attrs
        .and_then(|k| k.suffix.as_deref())
        .unwrap_or_else(|| schema.key_suffix(config));
    Ok(format!("{}{}{}", prefix, raw, suffix))
}

/// Invert [`storage_key`]: strip the effective prefix and suffix.
pub(crate) fn user_key<'a>(
    storage: &'a str,
    field: &FieldDescriptor,
    schema: &Schema,
    config: &OdmConfig,
) -> &'a str {
    let attrs = field.key.as_ref();
    let prefix = attrs
        .and_then(|k| k.prefix.as_deref())
        .unwrap_or_else(|| schema.key_prefix(config));
    let suffix = attrs
        .and_then(|k| k.suffix.as_deref())
        .unwrap_or_else(|| schema.key_suffix(config));
    let stripped = storage.strip_prefix(prefix).unwrap_or(storage);
    stripped.strip_suffix(suffix).unwrap_or(stripped)
}

/// Storage key of the lookup document for one indexed value.
pub(crate) fn ref_key(index_name: &str, value: &str, schema: &Schema, config: &OdmConfig) -> String {
    format!(
        "{}{}{}{}{}{}",
        schema.key_prefix(config),
        schema.ref_index_key_prefix(config),
        index_name,
        schema.delimiter(config),
        value,
        schema.key_suffix(config)
    )
}

/// Default index name for a field: trailing-`s` strip (when longer than one
/// character) followed by snake-to-camel casing.
pub(crate) fn derive_index_name(field_name: &str) -> String {
    let base = if field_name.len() > 1 && field_name.ends_with('s') {
        &field_name[..field_name.len() - 1]
    } else {
        field_name
    };
    let mut out = String::with_capacity(base.len());
    let mut upper_next = false;
    for ch in base.chars() {
        if ch == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaOptions;

    fn schema_with(options: SchemaOptions) -> Schema {
        let mut schema = Schema::with_options(options);
        schema.add(FieldDescriptor::string("email").key().no_generate());
        schema
    }

    #[test]
    fn storage_key_composition() {
        let config = OdmConfig::default();
        let schema = schema_with(SchemaOptions::new().key_prefix("user::"));
        let field = schema.field("email").unwrap();
        let key = storage_key(&Value::from("b@x"), field, &schema, &config).unwrap();
        assert_eq!(key, "user::b@x");
    }

    #[test]
    fn field_prefix_overrides_schema() {
        let config = OdmConfig::default();
        let mut schema = Schema::with_options(SchemaOptions::new().key_prefix("user::"));
        schema.add(
            FieldDescriptor::string("email")
                .key()
                .no_generate()
                .key_prefix("member::"),
        );
        let field = schema.field("email").unwrap();
        let key = storage_key(&Value::from("b@x"), field, &schema, &config).unwrap();
        assert_eq!(key, "member::b@x");
    }

    #[test]
    fn numeric_keys_render_base_10() {
        let config = OdmConfig::default();
        let schema = schema_with(SchemaOptions::new());
        let field = schema.field("email").unwrap();
        assert_eq!(
            storage_key(&Value::from(42), field, &schema, &config).unwrap(),
            "42"
        );
    }

    #[test]
    fn delimiter_in_value_is_rejected() {
        let config = OdmConfig::default();
        let schema = schema_with(SchemaOptions::new().delimiter("::"));
        let field = schema.field("email").unwrap();
        let err = storage_key(&Value::from("a::b"), field, &schema, &config).unwrap_err();
        assert!(matches!(err, OdmError::InvalidKey(_)));
    }

    #[test]
    fn non_scalar_key_is_rejected() {
        let config = OdmConfig::default();
        let schema = schema_with(SchemaOptions::new());
        let field = schema.field("email").unwrap();
        let err = storage_key(&Value::Bool(true), field, &schema, &config).unwrap_err();
        assert!(matches!(err, OdmError::InvalidKey(_)));
    }

    #[test]
    fn user_key_inverts_storage_key() {
        let config = OdmConfig::default();
        let schema = schema_with(SchemaOptions::new().key_prefix("user::").key_suffix("::v1"));
        let field = schema.field("email").unwrap();
        let storage = storage_key(&Value::from("b@x"), field, &schema, &config).unwrap();
        assert_eq!(user_key(&storage, field, &schema, &config), "b@x");
    }

    #[test]
    fn ref_key_format() {
        let config = OdmConfig::default();
        let schema = schema_with(
            SchemaOptions::new().key_prefix("user::").delimiter("::"),
        );
        assert_eq!(
            ref_key("email", "a@b", &schema, &config),
            "user::$_ref_by_email::a@b"
        );
    }

    #[test]
    fn index_name_derivation() {
        assert_eq!(derive_index_name("email"), "email");
        assert_eq!(derive_index_name("usernames"), "username");
        assert_eq!(derive_index_name("first_names"), "firstName");
        assert_eq!(derive_index_name("s"), "s");
    }
}
