use std::fmt;

use crate::store::StoreError;

/// Errors surfaced by document and index operations.
///
/// Validation failures are not errors at this level: they accumulate on the
/// document instance as [`SetError`](crate::document::SetError) records and
/// never abort an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OdmError {
    /// A user-visible key value could not be turned into a storage key.
    InvalidKey(String),
    /// The underlying store rejected or failed an operation.
    Store(StoreError),
    /// A pre-hook aborted the operation.
    Middleware(String),
    /// A lookup document points at a primary document that does not resolve.
    DanglingIndex { ref_key: String, target: String },
    /// A CAS conflict outlived the configured retry budget.
    ConcurrentModification(String),
    /// The save walker revisited a storage key already on its path.
    CyclicEmbedding(String),
    /// Aggregated lookup-document failures from a `wait_for_index` save.
    IndexFailed(Vec<OdmError>),
    /// A document body could not be serialized or deserialized.
    Serialization(String),
}

impl fmt::Display for OdmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OdmError::InvalidKey(msg) => write!(f, "invalid key: {}", msg),
            OdmError::Store(err) => write!(f, "store error: {}", err),
            OdmError::Middleware(msg) => write!(f, "middleware aborted: {}", msg),
            OdmError::DanglingIndex { ref_key, target } => write!(
                f,
                "lookup document {} references missing document {}",
                ref_key, target
            ),
            OdmError::ConcurrentModification(key) => {
                write!(f, "concurrent modification of {}", key)
            }
            OdmError::CyclicEmbedding(key) => {
                write!(f, "embedded document cycle at {}", key)
            }
            OdmError::IndexFailed(errors) => {
                write!(f, "{} lookup document update(s) failed", errors.len())
            }
            OdmError::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for OdmError {}

impl From<StoreError> for OdmError {
    fn from(err: StoreError) -> Self {
        OdmError::Store(err)
    }
}
