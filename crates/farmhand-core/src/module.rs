use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    FarmError,
    protocol::{CallTarget, LogEnvelope, LogLevel, MasterCall},
    value::{CallArg, Handle},
};

/// A bundle of named methods executable inside a worker.
///
/// Implementations run on both sides of the farm: inside child processes
/// for dispatched calls, and in the parent for the local fallback path and
/// for master-call targets.
#[async_trait]
pub trait WorkerModule: Send + Sync + 'static {
    /// Invokes the named method, or the module's default entry when
    /// `method` is `None`.
    async fn invoke(
        &self,
        ctx: &WorkerContext,
        method: Option<&str>,
        args: Vec<CallArg>,
    ) -> Result<Value, FarmError>;
}

/// Mapping from a path-like module id to its handler.
///
/// Populated by the embedder at startup; both the parent farm and each
/// worker binary carry one.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn WorkerModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<String>, module: Arc<dyn WorkerModule>) {
        self.modules.insert(path.into(), module);
    }

    pub fn with_module(mut self, path: impl Into<String>, module: Arc<dyn WorkerModule>) -> Self {
        self.register(path, module);
        self
    }

    pub fn resolve(&self, path: &str) -> Result<Arc<dyn WorkerModule>, FarmError> {
        self.modules.get(path).cloned().ok_or_else(|| {
            FarmError::not_found("unknown worker module").with_detail(path.to_string())
        })
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        paths.sort_unstable();
        f.debug_struct("ModuleRegistry")
            .field("modules", &paths)
            .finish()
    }
}

/// The path a worker-side call takes back into the parent.
#[async_trait]
pub trait MasterBridge: Send + Sync + 'static {
    /// Forwards one request parent-ward. Returns the response value when
    /// `call.await_response` is set, `None` otherwise.
    async fn forward(&self, call: MasterCall) -> Result<Option<Value>, FarmError>;

    /// Forwards one log event parent-ward. Never blocks.
    fn forward_log(&self, envelope: LogEnvelope);
}

/// Per-invocation context handed to worker methods.
#[derive(Clone)]
pub struct WorkerContext {
    bridge: Arc<dyn MasterBridge>,
}

impl WorkerContext {
    pub fn new(bridge: Arc<dyn MasterBridge>) -> Self {
        Self { bridge }
    }

    /// Invokes a parent-side reverse handle and awaits its result.
    pub async fn call_handle(
        &self,
        handle: Handle,
        args: Vec<CallArg>,
    ) -> Result<Value, FarmError> {
        let response = self
            .bridge
            .forward(MasterCall {
                idx: None,
                target: CallTarget::Handle { id: handle.id },
                method: None,
                args,
                await_response: true,
            })
            .await?;
        response.ok_or_else(|| FarmError::internal("awaited handle call returned no response"))
    }

    /// Sends a request into the parent. The response is `None` when
    /// `await_response` is false.
    pub async fn call_master(&self, call: MasterCall) -> Result<Option<Value>, FarmError> {
        self.bridge.forward(call).await
    }

    /// Emits a log event on the parent logger.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.bridge.forward_log(LogEnvelope {
            level,
            message: message.into(),
        });
    }
}

type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, FarmError>> + Send>>;
type MethodFn = Box<dyn Fn(WorkerContext, Vec<CallArg>) -> MethodFuture + Send + Sync>;

/// [`WorkerModule`] built from plain async functions, one per method name.
///
/// This is the handler-record shape most embedders want: register the
/// methods, hand the table to the registry.
#[derive(Default)]
pub struct MethodTable {
    default_entry: Option<MethodFn>,
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkerContext, Vec<CallArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FarmError>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Box::new(move |ctx, args| Box::pin(f(ctx, args))));
        self
    }

    /// Entry invoked when a request names no method.
    pub fn default_entry<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkerContext, Vec<CallArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FarmError>> + Send + 'static,
    {
        self.default_entry = Some(Box::new(move |ctx, args| Box::pin(f(ctx, args))));
        self
    }
}

#[async_trait]
impl WorkerModule for MethodTable {
    async fn invoke(
        &self,
        ctx: &WorkerContext,
        method: Option<&str>,
        args: Vec<CallArg>,
    ) -> Result<Value, FarmError> {
        let entry = match method {
            Some(name) => self.methods.get(name).ok_or_else(|| {
                FarmError::not_found("unknown worker method").with_detail(name.to_string())
            })?,
            None => self.default_entry.as_ref().ok_or_else(|| {
                FarmError::invalid_request("module has no default entry")
            })?,
        };
        entry(ctx.clone(), args).await
    }
}
