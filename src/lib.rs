//! docket — a schema-driven object-document mapper for key-value document
//! stores with CAS-based optimistic concurrency.
//!
//! Applications declare typed schemas, instantiate documents, and persist
//! them with automatic key derivation, embedded-document expansion,
//! reference-based secondary indexing, and pluggable middleware. The store
//! itself stays abstract behind the async [`Bucket`] trait;
//! [`InMemoryBucket`] is the reference implementation.
//!
//! ## Example
//!
//! ```ignore
//! use docket::{FieldDescriptor, InMemoryBucket, Odm, OdmConfig, SaveOptions, Schema};
//!
//! let odm = Odm::new(InMemoryBucket::new(), OdmConfig::default());
//! let mut schema = Schema::new();
//! schema.add(FieldDescriptor::string("email").key().no_generate());
//! schema.add(FieldDescriptor::string("name"));
//! let users = odm.model("User", schema);
//!
//! let mut bob = users.create();
//! bob.set("email", "b@x");
//! bob.set("name", "Bob");
//! bob.save(SaveOptions::default()).await?;
//!
//! let found = users.find("b@x").await?;
//! ```

mod config;
mod document;
mod error;
mod index;
mod key;
mod model;
mod odm;
mod schema;
mod store;
mod value;

pub use config::OdmConfig;
pub use document::{
    Document, DocumentEmitter, Event, EventKind, RemoveOptions, SaveOptions, SetError,
    ToObjectOptions,
};
pub use error::OdmError;
pub use model::{FindOptions, FindResult, Model, Populate};
pub use odm::Odm;
pub use schema::{
    ArrayAttrs, AsyncHookFn, BoxFuture, DefaultSpec, DefaultThunk, FieldDescriptor, FieldKind,
    GetterFn, Hook, HookChain, KeyAttrs, MethodFn, NumberAttrs, ObjectTransformFn, Schema,
    SchemaOptions, StaticFn, StringAttrs, StringTransformFn, SyncHookFn, TransformFn, ValidatorFn,
    ValueSetGuardFn, ValueSetNotifyFn, Virtual,
};
pub use store::{Bucket, Cas, InMemoryBucket, Stored, StoreError, WriteOptions};
pub use value::Value;
