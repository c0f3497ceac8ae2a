use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::document::Document;
use crate::error::OdmError;

/// Lifecycle events observable on a document instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EventKind {
    Save,
    Remove,
    Index,
    Error,
}

/// Payload handed to listeners. `errors` is non-empty for `Index` events
/// with failed lookup updates and for `Error` events.
pub struct Event<'a> {
    pub kind: EventKind,
    pub document: &'a Document,
    pub errors: &'a [OdmError],
}

type Listener = Box<dyn Fn(&Event<'_>) + Send + Sync>;

/// Per-document observer registry. Clones share the listener table.
#[derive(Clone)]
pub struct DocumentEmitter {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<Listener>>>>,
}

impl DocumentEmitter {
    pub fn new() -> Self {
        DocumentEmitter {
            listeners: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().expect("lock poisoned");
        listeners.entry(kind).or_default().push(Box::new(listener));
    }

    pub fn emit(&self, kind: EventKind, document: &Document, errors: &[OdmError]) {
        let listeners = self.listeners.read().expect("lock poisoned");
        if let Some(registered) = listeners.get(&kind) {
            let event = Event {
                kind,
                document,
                errors,
            };
            for listener in registered {
                listener(&event);
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        let listeners = self.listeners.read().expect("lock poisoned");
        listeners.get(&kind).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for DocumentEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read().expect("lock poisoned");
        f.debug_struct("DocumentEmitter")
            .field("events", &listeners.keys())
            .finish()
    }
}
