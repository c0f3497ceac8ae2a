mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use docket::{
    BoxFuture, Document, EventKind, FieldDescriptor, FindOptions, Odm, OdmConfig, OdmError,
    RemoveOptions, SaveOptions, Schema, SchemaOptions, StoreError, ToObjectOptions, Value,
};
use serde_json::json;
use support::{odm_with_memory, FlakyBucket};

fn user_schema() -> Schema {
    let mut schema = Schema::new();
    schema.add(
        FieldDescriptor::string("email")
            .key()
            .no_generate()
            .key_prefix("user::"),
    );
    schema.add(FieldDescriptor::string("name"));
    schema.add(FieldDescriptor::number("age").min(0.0));
    schema.add(FieldDescriptor::date("joined"));
    schema
}

#[tokio::test]
async fn save_persists_user_visible_body() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut bob = users.create_from(json!({"name": "Bob", "email": "b@x"}));
    bob.save(SaveOptions::default()).await.unwrap();

    assert_eq!(
        bucket.peek("user::b@x"),
        Some(json!({"name": "Bob", "email": "b@x"}))
    );
    assert!(bob.is_persisted());
    assert!(bob.cas().is_some());
}

#[tokio::test]
async fn save_generates_uuid_key_when_missing() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let mut schema = Schema::new();
    schema.add(FieldDescriptor::string("name"));
    let things = odm.model("Thing", schema);

    let mut doc = things.create_from(json!({"name": "widget"}));
    assert_eq!(doc.get("id"), None);
    doc.save(SaveOptions::default()).await.unwrap();

    let id = doc.get("id").unwrap();
    let id = id.as_str().unwrap();
    assert_eq!(id.len(), 36);
    assert_eq!(id.matches('-').count(), 4);
    assert!(bucket.contains(id));
}

#[tokio::test]
async fn missing_key_without_generation_fails() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"name": "anon"}));
    let err = doc.save(SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, OdmError::InvalidKey(_)));
    assert!(bucket.is_empty());
}

#[tokio::test]
async fn round_trip_preserves_the_document() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut saved = users.create_from(json!({
        "email": "ada@x",
        "name": "Ada",
        "age": 36,
        "joined": "2021-03-14T09:26:53Z",
    }));
    saved.save(SaveOptions::default()).await.unwrap();

    let found = users.find("ada@x").await.unwrap().expect("document");
    let opts = ToObjectOptions {
        minimize: Some(false),
        ..ToObjectOptions::default()
    };
    assert_eq!(saved.to_object(&opts), found.to_object(&opts));
    assert_eq!(found.cas(), saved.cas());
    assert!(found.is_persisted());
    assert!(matches!(found.get("joined"), Some(Value::Date(_))));
}

#[tokio::test]
async fn find_by_ids_reports_misses() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    for email in ["k1@x", "k3@x"] {
        let mut doc = users.create_from(json!({"email": email}));
        doc.save(SaveOptions::default()).await.unwrap();
    }

    let result = users
        .find_by_ids(&["k1@x", "k2@x", "k3@x"], FindOptions::default())
        .await
        .unwrap();
    assert_eq!(result.documents.len(), 2);
    assert_eq!(result.misses, vec!["k2@x".to_string()]);

    let silenced = users
        .find_by_ids(
            &["k1@x", "k2@x", "k3@x"],
            FindOptions {
                missing: Some(false),
                ..FindOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(silenced.documents.len(), 2);
    assert!(silenced.misses.is_empty());
}

#[tokio::test]
async fn stale_cas_save_fails_and_leaves_store_unchanged() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut original = users.create_from(json!({"email": "e@x", "name": "v1"}));
    original.save(SaveOptions::default()).await.unwrap();

    let mut first = users.find("e@x").await.unwrap().unwrap();
    let mut second = users.find("e@x").await.unwrap().unwrap();
    assert_eq!(first.cas(), second.cas());

    first.set("name", "from-first");
    first.save(SaveOptions::default()).await.unwrap();

    second.set("name", "from-second");
    let err = second.save(SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, OdmError::ConcurrentModification(_)));
    assert_eq!(
        bucket.peek("user::e@x"),
        Some(json!({"email": "e@x", "name": "from-first"}))
    );
}

#[tokio::test]
async fn pre_hook_error_prevents_any_write() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let mut schema = user_schema();
    schema.pre("save", |_: &mut Document| {
        Err(OdmError::Middleware("not today".into()))
    });
    let users = odm.model("User", schema);

    let mut doc = users.create_from(json!({"email": "e@x"}));
    let err = doc.save(SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, OdmError::Middleware(_)));
    assert!(bucket.is_empty());
    assert!(doc.is_new());
}

fn stamp_name(doc: &mut Document) -> BoxFuture<'_, Result<(), OdmError>> {
    Box::pin(async move {
        doc.set("name", "stamped");
        Ok(())
    })
}

#[tokio::test]
async fn async_pre_hook_completes_before_write() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let mut schema = user_schema();
    schema.pre_async("save", stamp_name);
    let users = odm.model("User", schema);

    let mut doc = users.create_from(json!({"email": "e@x"}));
    doc.save(SaveOptions::default()).await.unwrap();
    assert_eq!(
        bucket.peek("user::e@x"),
        Some(json!({"email": "e@x", "name": "stamped"}))
    );
}

#[tokio::test]
async fn post_hook_error_does_not_reverse_the_save() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default().with_emit_errors(true));
    let mut schema = user_schema();
    schema.post("save", |_: &mut Document| {
        Err(OdmError::Middleware("post boom".into()))
    });
    let users = odm.model("User", schema);

    let mut doc = users.create_from(json!({"email": "e@x"}));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    doc.on(EventKind::Error, move |event| {
        let mut seen = sink.lock().unwrap();
        for err in event.errors {
            seen.push(err.to_string());
        }
    });

    doc.save(SaveOptions::default()).await.unwrap();
    assert!(bucket.contains("user::e@x"));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("post boom"));
}

#[tokio::test]
async fn save_and_remove_emit_events() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "e@x"}));
    let counts = Arc::new(AtomicUsize::new(0));
    let saves = Arc::clone(&counts);
    doc.on(EventKind::Save, move |_| {
        saves.fetch_add(1, Ordering::SeqCst);
    });
    let removes = Arc::new(AtomicUsize::new(0));
    let removed = Arc::clone(&removes);
    doc.on(EventKind::Remove, move |_| {
        removed.fetch_add(1, Ordering::SeqCst);
    });

    doc.save(SaveOptions::default()).await.unwrap();
    doc.save(SaveOptions::default()).await.unwrap();
    doc.remove(RemoveOptions::default()).await.unwrap();

    assert_eq!(counts.load(Ordering::SeqCst), 2);
    assert_eq!(removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn remove_detaches_but_keeps_memory_state() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "e@x", "name": "Bob"}));
    doc.save(SaveOptions::default()).await.unwrap();
    assert!(bucket.contains("user::e@x"));

    doc.remove(RemoveOptions::default()).await.unwrap();
    assert!(!bucket.contains("user::e@x"));
    assert!(doc.is_new());
    assert!(doc.cas().is_none());
    // post-hooks can still read the state
    assert_eq!(doc.get("name"), Some(Value::from("Bob")));
}

#[tokio::test]
async fn lean_remove_tolerates_missing_documents() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "ghost@x"}));
    doc.remove(RemoveOptions {
        lean: true,
        ..RemoveOptions::default()
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn non_lean_remove_of_missing_document_errors() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "ghost@x"}));
    let err = doc.remove(RemoveOptions::default()).await.unwrap_err();
    assert!(matches!(err, OdmError::Store(StoreError::NotFound(_))));
}

#[tokio::test]
async fn temporary_errors_retry_when_enabled() {
    let config = OdmConfig::default()
        .with_retry_temporary_errors(true)
        .with_temp_retry(5, std::time::Duration::ZERO);
    let odm = Odm::new(FlakyBucket::new(2), config);
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "e@x"}));
    doc.save(SaveOptions::default()).await.unwrap();
}

#[tokio::test]
async fn temporary_errors_surface_when_retry_disabled() {
    let odm = Odm::new(FlakyBucket::new(1), OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "e@x"}));
    let err = doc.save(SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, OdmError::Store(StoreError::Temporary(_))));
}

#[tokio::test]
async fn validation_errors_accumulate_silently() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({"email": "e@x", "age": -3}));
    assert!(doc.has_errors());
    assert_eq!(doc.errors()[0].field, "age");

    // the save itself is unaffected; the rejected field was never committed
    doc.save(SaveOptions::default()).await.unwrap();
    assert_eq!(bucket.peek("user::e@x"), Some(json!({"email": "e@x"})));
    assert!(doc.has_errors());
}

#[tokio::test]
async fn custom_hook_chains_run_on_demand() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let mut schema = user_schema();
    schema.pre("publish", |doc: &mut Document| {
        doc.set("name", "published");
        Ok(())
    });
    schema.post("publish", |doc: &mut Document| {
        doc.set("age", 1);
        Ok(())
    });
    let users = odm.model("User", schema);

    let mut doc = users.create_from(json!({"email": "e@x"}));
    doc.run_hook_chain("publish").await.unwrap();
    assert_eq!(doc.get("name"), Some(Value::from("published")));
    assert_eq!(doc.get("age"), Some(Value::from(1)));
}

#[tokio::test]
async fn user_statics_dispatch_through_the_model() {
    let (odm, _bucket) = odm_with_memory(OdmConfig::default());
    let mut schema = user_schema();
    schema.static_fn("domain_of", |_, args| {
        let email = args.as_str().unwrap_or_default();
        Value::from(email.split_once('@').map(|(_, d)| d).unwrap_or(""))
    });
    let users = odm.model("User", schema);

    assert_eq!(
        users.call_static("domain_of", Value::from("bob@example.org")),
        Some(Value::from("example.org"))
    );
    assert_eq!(users.call_static("missing", Value::Null), None);
}

#[tokio::test]
async fn dates_round_trip_through_epoch_storage() {
    let (odm, bucket) = odm_with_memory(OdmConfig::default());
    let users = odm.model("User", user_schema());

    let mut doc = users.create_from(json!({
        "email": "e@x",
        "joined": "2021-03-14T09:26:53Z",
    }));
    doc.save(SaveOptions::default()).await.unwrap();

    let stored = bucket.peek("user::e@x").unwrap();
    assert_eq!(stored["joined"], json!(1615714013000i64));

    let found = users.find("e@x").await.unwrap().unwrap();
    let joined = found.get("joined").unwrap().as_date().unwrap();
    assert_eq!(joined.timestamp(), 1615714013);
    assert_eq!(found.to_json()["joined"], json!("2021-03-14T09:26:53+00:00"));
}

#[tokio::test]
async fn schema_options_override_config() {
    let config = OdmConfig::default().with_key_prefix("cfg::");
    let (odm, bucket) = odm_with_memory(config);
    let mut schema = Schema::with_options(SchemaOptions::new().key_prefix("sch::"));
    schema.add(FieldDescriptor::string("slug").key().no_generate());
    let model = odm.model("Page", schema);

    let mut doc = model.create_from(json!({"slug": "home"}));
    doc.save(SaveOptions::default()).await.unwrap();
    assert!(bucket.contains("sch::home"));
    assert!(!bucket.contains("cfg::home"));
}
