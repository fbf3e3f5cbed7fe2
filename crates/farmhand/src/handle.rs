use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use farmhand_core::{CallArg, FarmError, Handle, HandleId};
use serde_json::Value;

pub(crate) type ReverseFuture = Pin<Box<dyn Future<Output = Result<Value, FarmError>> + Send>>;
pub(crate) type ReverseFn = Arc<dyn Fn(Vec<CallArg>) -> ReverseFuture + Send + Sync>;

/// Parent-side table of functions reachable from workers by handle id.
///
/// Handles only ever travel as ids; the function itself never leaves the
/// parent. Ids are farm-unique and never reused.
pub(crate) struct HandleRegistry {
    next_id: AtomicU64,
    handles: Mutex<HashMap<HandleId, ReverseFn>>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn create<F, Fut>(&self, f: F) -> Handle
    where
        F: Fn(Vec<CallArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FarmError>> + Send + 'static,
    {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let func: ReverseFn = Arc::new(move |args| Box::pin(f(args)));
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(id, func);
        }
        Handle { id }
    }

    pub(crate) fn resolve(&self, id: HandleId) -> Result<ReverseFn, FarmError> {
        let handles = self
            .handles
            .lock()
            .map_err(|_| FarmError::internal("reverse handle table poisoned"))?;
        handles.get(&id).cloned().ok_or_else(|| {
            FarmError::not_found("unknown reverse handle").with_detail(id.0.to_string())
        })
    }
}
