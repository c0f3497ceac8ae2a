//! The ODM handle — owns the shared store client, the configuration, and
//! the model registry. Registration is write-once at model-definition
//! time; lookups afterwards are read-only.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::OdmConfig;
use crate::model::Model;
use crate::schema::Schema;
use crate::store::Bucket;

struct OdmInner {
    bucket: Arc<dyn Bucket>,
    config: OdmConfig,
    models: RwLock<HashMap<String, Arc<Schema>>>,
}

/// Cheap-to-clone handle scoping the model registry to an explicit value —
/// no process-wide state.
#[derive(Clone)]
pub struct Odm {
    inner: Arc<OdmInner>,
}

impl Odm {
    pub fn new(bucket: impl Bucket + 'static, config: OdmConfig) -> Self {
        Self::with_bucket(Arc::new(bucket), config)
    }

    pub fn with_bucket(bucket: Arc<dyn Bucket>, config: OdmConfig) -> Self {
        Odm {
            inner: Arc::new(OdmInner {
                bucket,
                config,
                models: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Compile `schema` and register it under `name`. Re-registering a name
    /// replaces the previous schema.
    pub fn model(&self, name: &str, mut schema: Schema) -> Model {
        schema.compile(name);
        let schema = Arc::new(schema);
        self.inner
            .models
            .write()
            .expect("lock poisoned")
            .insert(name.to_string(), Arc::clone(&schema));
        Model::new(self.clone(), name.to_string(), schema)
    }

    /// Look up a registered model by name.
    pub fn model_named(&self, name: &str) -> Option<Model> {
        let schema = self.schema_for(name)?;
        Some(Model::new(self.clone(), name.to_string(), schema))
    }

    pub(crate) fn schema_for(&self, name: &str) -> Option<Arc<Schema>> {
        self.inner
            .models
            .read()
            .expect("lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn bucket(&self) -> Arc<dyn Bucket> {
        Arc::clone(&self.inner.bucket)
    }

    pub fn config(&self) -> &OdmConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Odm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let models = self.inner.models.read().expect("lock poisoned");
        f.debug_struct("Odm")
            .field("models", &models.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use crate::store::InMemoryBucket;

    #[test]
    fn register_and_look_up() {
        let odm = Odm::new(InMemoryBucket::new(), OdmConfig::default());
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("name"));
        odm.model("User", schema);

        let model = odm.model_named("User").expect("registered");
        assert_eq!(model.name(), "User");
        assert!(odm.model_named("Ghost").is_none());
    }

    #[test]
    fn clones_share_the_registry() {
        let odm = Odm::new(InMemoryBucket::new(), OdmConfig::default());
        let clone = odm.clone();
        let mut schema = Schema::new();
        schema.add(FieldDescriptor::string("name"));
        clone.model("User", schema);
        assert!(odm.model_named("User").is_some());
    }
}
