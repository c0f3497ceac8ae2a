use std::time::Duration;

/// ODM-wide options. Schema-level options override the key and serialization
/// settings per model; retry and index settings apply globally.
#[derive(Clone, Debug)]
pub struct OdmConfig {
    /// Prepended to user-visible key values when deriving storage keys.
    pub key_prefix: String,
    /// Appended to user-visible key values when deriving storage keys.
    pub key_suffix: String,
    /// Separator used inside derived keys. Key values may not contain it.
    pub delimiter: String,
    /// Marker segment of lookup-document keys.
    pub ref_index_key_prefix: String,
    /// Store the full storage key in lookup documents and embedded
    /// references instead of the user-visible key.
    pub store_full_reference_id: bool,
    /// Persist the key field as its full storage key instead of the
    /// user-visible value.
    pub store_full_key: bool,
    /// Option-surface parity with shape-polymorphic find APIs. The typed
    /// API satisfies it statically: `find_by_id` returns an `Option`,
    /// `find_by_ids` a `FindResult`.
    pub always_return_arrays: bool,
    /// Fail a save when its lookup-document updates fail, instead of
    /// emitting `index` events.
    pub wait_for_index: bool,
    /// Drop empty objects and arrays when serializing documents.
    pub minimize: bool,
    /// Report missed ids from `find_by_ids`.
    pub missing: bool,
    /// Return `find_by_ids` results in input order instead of store order.
    pub keep_sort_order: bool,
    /// Retry store calls that fail with a temporary error.
    pub retry_temporary_errors: bool,
    /// Attempts for temporary-error retries.
    pub temp_retry_times: u32,
    /// Pause between temporary-error retries.
    pub temp_retry_interval: Duration,
    /// Attempts for lookup-document CAS loops.
    pub atomic_retry_times: u32,
    /// Pause between lookup-document CAS attempts.
    pub atomic_retry_interval: Duration,
    /// Serialize concurrent lookup-document writers with `get_and_lock`.
    pub atomic_lock: bool,
    /// Fail `find_by` with `DanglingIndex` on a broken lookup instead of
    /// resolving empty.
    pub error_on_missing_index: bool,
    /// Emit `error` events for post-hook failures.
    pub emit_errors: bool,
}

impl Default for OdmConfig {
    fn default() -> Self {
        OdmConfig {
            key_prefix: String::new(),
            key_suffix: String::new(),
            delimiter: "_".to_string(),
            ref_index_key_prefix: "$_ref_by_".to_string(),
            store_full_reference_id: false,
            store_full_key: false,
            always_return_arrays: false,
            wait_for_index: false,
            minimize: true,
            missing: true,
            keep_sort_order: false,
            retry_temporary_errors: false,
            temp_retry_times: 5,
            temp_retry_interval: Duration::from_millis(50),
            atomic_retry_times: 5,
            atomic_retry_interval: Duration::ZERO,
            atomic_lock: true,
            error_on_missing_index: false,
            emit_errors: false,
        }
    }
}

impl OdmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_key_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.key_suffix = suffix.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_ref_index_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ref_index_key_prefix = prefix.into();
        self
    }

    pub fn with_store_full_reference_id(mut self, on: bool) -> Self {
        self.store_full_reference_id = on;
        self
    }

    pub fn with_store_full_key(mut self, on: bool) -> Self {
        self.store_full_key = on;
        self
    }

    pub fn with_wait_for_index(mut self, on: bool) -> Self {
        self.wait_for_index = on;
        self
    }

    pub fn with_retry_temporary_errors(mut self, on: bool) -> Self {
        self.retry_temporary_errors = on;
        self
    }

    pub fn with_temp_retry(mut self, times: u32, interval: Duration) -> Self {
        self.temp_retry_times = times;
        self.temp_retry_interval = interval;
        self
    }

    pub fn with_atomic_retry(mut self, times: u32, interval: Duration) -> Self {
        self.atomic_retry_times = times;
        self.atomic_retry_interval = interval;
        self
    }

    pub fn with_atomic_lock(mut self, on: bool) -> Self {
        self.atomic_lock = on;
        self
    }

    pub fn with_error_on_missing_index(mut self, on: bool) -> Self {
        self.error_on_missing_index = on;
        self
    }

    pub fn with_emit_errors(mut self, on: bool) -> Self {
        self.emit_errors = on;
        self
    }
}
