//! Lifecycle middleware — ordered hook chains per event name. A hook is
//! either sync (control continues when it returns) or async (its boxed
//! future is the explicit completion channel); an error on either
//! short-circuits the chain.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::document::Document;
use crate::error::OdmError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type SyncHookFn = Arc<dyn Fn(&mut Document) -> Result<(), OdmError> + Send + Sync>;
pub type AsyncHookFn =
    Arc<dyn for<'a> Fn(&'a mut Document) -> BoxFuture<'a, Result<(), OdmError>> + Send + Sync>;

#[derive(Clone)]
pub enum Hook {
    Sync(SyncHookFn),
    Async(AsyncHookFn),
}

impl Hook {
    pub(crate) async fn run(&self, doc: &mut Document) -> Result<(), OdmError> {
        match self {
            Hook::Sync(f) => f(doc),
            Hook::Async(f) => f(doc).await,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Sync(_) => f.write_str("Hook::Sync(..)"),
            Hook::Async(_) => f.write_str("Hook::Async(..)"),
        }
    }
}

/// Pre and post hooks for one event name, in registration order.
#[derive(Clone, Default)]
pub struct HookChain {
    pub(crate) pre: Vec<Hook>,
    pub(crate) post: Vec<Hook>,
}

impl HookChain {
    pub fn new() -> Self {
        HookChain::default()
    }
}

/// Run hooks in order; the first error aborts the rest of the chain.
pub(crate) async fn run_hooks(hooks: &[Hook], doc: &mut Document) -> Result<(), OdmError> {
    for hook in hooks {
        hook.run(doc).await?;
    }
    Ok(())
}
