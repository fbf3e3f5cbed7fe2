use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use async_trait::async_trait;
use farmhand_core::{
    CallArg, CallResult, CallTarget, ErrorCode, FarmError, FarmMessage, Handle, LogEnvelope,
    MasterBridge, MasterCall, ModuleRegistry, PROTOCOL_VERSION, WorkerContext, WorkerId,
    WorkerMessage,
};
use serde_json::Value;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot, watch,
};

use crate::{
    handle::HandleRegistry,
    logs,
    options::FarmOptions,
    shared,
    worker::{PendingCall, Worker, WorkerEvent},
};

/// A method invocation waiting in the queue for a worker slot.
pub(crate) struct Call {
    pub(crate) method: String,
    pub(crate) args: Vec<CallArg>,
    pub(crate) retries: u32,
    pub(crate) completer: oneshot::Sender<Result<Value, FarmError>>,
}

struct FarmState {
    queue: VecDeque<Call>,
    /// Insertion order is dispatch order.
    workers: Vec<Worker>,
    next_worker_id: u64,
    warm_workers: usize,
    warmed_up: bool,
    ending: bool,
}

pub(crate) struct FarmInner {
    options: FarmOptions,
    worker_path: String,
    registry: Arc<ModuleRegistry>,
    handles: HandleRegistry,
    state: Mutex<FarmState>,
    events: UnboundedSender<WorkerEvent>,
    warmed: watch::Sender<bool>,
}

/// The parent-side dispatcher: queues calls, routes them across the
/// worker pool, and serves requests coming back from workers.
#[derive(Clone)]
pub struct Farm {
    inner: Arc<FarmInner>,
}

impl std::fmt::Debug for Farm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Farm").finish_non_exhaustive()
    }
}

/// Caller-facing entry for one method name on the worker module.
pub struct MethodCaller {
    farm: Farm,
    method: String,
}

impl MethodCaller {
    pub async fn call(&self, args: Vec<CallArg>) -> Result<Value, FarmError> {
        self.farm.inner.dispatch(&self.method, args).await
    }
}

impl Farm {
    /// Builds a farm and starts its worker pool.
    ///
    /// Must be called inside a tokio runtime; fails when the options name
    /// no worker path.
    pub fn new(options: FarmOptions) -> Result<Farm, FarmError> {
        let worker_path = match options.worker_path.as_deref() {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => return Err(FarmError::invalid_request("Please provide a worker path!")),
        };

        let (events, event_rx) = mpsc::unbounded_channel();
        let (warmed, _) = watch::channel(false);
        let inner = Arc::new(FarmInner {
            registry: options.modules.clone(),
            options,
            worker_path,
            handles: HandleRegistry::new(),
            state: Mutex::new(FarmState {
                queue: VecDeque::new(),
                workers: Vec::new(),
                next_worker_id: 0,
                warm_workers: 0,
                warmed_up: false,
                ending: false,
            }),
            events,
            warmed,
        });

        tokio::spawn(event_pump(Arc::downgrade(&inner), event_rx));
        inner.start_max_workers()?;
        Ok(Farm { inner })
    }

    /// Makes a caller for an arbitrary method name on the worker module.
    pub fn create_handle(&self, method: impl Into<String>) -> MethodCaller {
        MethodCaller {
            farm: self.clone(),
            method: method.into(),
        }
    }

    /// Preconfigured caller for the worker module's `run` method.
    pub async fn run(&self, args: Vec<CallArg>) -> Result<Value, FarmError> {
        self.inner.dispatch("run", args).await
    }

    /// Registers a parent-side function and returns the handle workers
    /// use to call it back.
    pub fn create_reverse_handle<F, Fut>(&self, f: F) -> Handle
    where
        F: Fn(Vec<CallArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FarmError>> + Send + 'static,
    {
        self.inner.handles.create(f)
    }

    /// Serves one request against parent-resident code, as a worker
    /// request frame would.
    pub async fn process_request(&self, call: MasterCall) -> Result<Option<Value>, FarmError> {
        self.inner.process_request(call, None).await
    }

    /// Stops every worker and rejects whatever was still pending. New
    /// calls fail while the farm is ending.
    pub async fn end(&self) -> Result<(), FarmError> {
        self.inner.end().await?;
        shared::release(self);
        Ok(())
    }

    /// Completes once every started worker has finished a warmup call.
    pub async fn warmed_up(&self) {
        let mut warmed = self.inner.warmed.subscribe();
        loop {
            if *warmed.borrow_and_update() {
                return;
            }
            if warmed.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn options(&self) -> &FarmOptions {
        &self.inner.options
    }

    pub fn worker_path(&self) -> &str {
        &self.inner.worker_path
    }

    /// True when both values refer to the same farm instance.
    pub fn ptr_eq(a: &Farm, b: &Farm) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl FarmInner {
    fn state_lock(&self) -> Result<MutexGuard<'_, FarmState>, FarmError> {
        self.state
            .lock()
            .map_err(|_| FarmError::internal("worker farm state lock poisoned"))
    }

    fn ending_error() -> FarmError {
        FarmError::new(
            ErrorCode::Ending,
            "Cannot add a worker call if workerfarm is ending",
        )
    }

    fn start_max_workers(self: &Arc<Self>) -> Result<(), FarmError> {
        let mut state = self.state_lock()?;
        while state.workers.len() < self.options.max_concurrent_workers {
            self.spawn_worker(&mut state)?;
        }
        Ok(())
    }

    fn spawn_worker(&self, state: &mut FarmState) -> Result<(), FarmError> {
        let id = WorkerId(state.next_worker_id);
        state.next_worker_id += 1;
        let worker = Worker::spawn(
            id,
            &self.worker_path,
            self.options.worker_bin.as_deref(),
            self.options.max_frame_size,
            self.registry.clone(),
            self.events.clone(),
        )?;
        tracing::debug!(worker = id.0, "spawned worker");
        state.workers.push(worker);
        Ok(())
    }

    /// Enqueues one call and waits for its completion.
    pub(crate) async fn add_call(
        self: &Arc<Self>,
        method: String,
        args: Vec<CallArg>,
    ) -> Result<Value, FarmError> {
        let receiver = {
            let mut state = self.state_lock()?;
            if state.ending {
                return Err(Self::ending_error());
            }
            let (completer, receiver) = oneshot::channel();
            state.queue.push_back(Call {
                method,
                args,
                retries: 0,
                completer,
            });
            receiver
        };
        self.process_queue();

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FarmError::new(
                ErrorCode::Ending,
                "worker farm ended before the call completed",
            )),
        }
    }

    /// Per-invocation choice between the remote pool and the local path.
    fn should_use_remote(&self) -> Result<bool, FarmError> {
        if !self.options.use_local_worker {
            return Ok(true);
        }
        let state = self.state_lock()?;
        Ok((state.warm_workers >= state.workers.len() || !self.options.warm_workers)
            && self.options.max_concurrent_workers > 0)
    }

    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        method: &str,
        mut args: Vec<CallArg>,
    ) -> Result<Value, FarmError> {
        if self.should_use_remote()? {
            args.push(CallArg::data(false));
            return self.add_call(method.to_string(), args).await;
        }

        if self.options.warm_workers && self.options.max_concurrent_workers > 0 {
            self.warmup_worker(method, args.clone());
        }

        // The wire round-trip keeps local value semantics identical to
        // the remote path: a fresh deep copy, nothing shared.
        args.push(CallArg::data(false));
        let args = farmhand_ipc::roundtrip(&args).map_err(|err| {
            FarmError::internal("copy local call arguments").with_detail(err.to_string())
        })?;
        let module = self.registry.resolve(&self.worker_path)?;
        let ctx = WorkerContext::new(self.local_bridge());
        module.invoke(&ctx, Some(method), args).await
    }

    /// Shadow-dispatches a local call remotely with the warmup flag set.
    /// The result is discarded; completion feeds the warmup counter.
    fn warmup_worker(self: &Arc<Self>, method: &str, mut args: Vec<CallArg>) {
        args.push(CallArg::data(true));
        let farm = Arc::clone(self);
        let method = method.to_string();
        tokio::spawn(async move {
            let _ = farm.add_call(method, args).await;
        });
    }

    /// One scheduling step: top the pool up, then shift the queue head
    /// onto workers with spare capacity, in insertion order.
    ///
    /// Synchronous on purpose: every state mutation lands before any
    /// suspension point, so the scheduler never races with itself.
    pub(crate) fn process_queue(self: &Arc<Self>) {
        let Ok(mut state) = self.state_lock() else {
            return;
        };
        if state.ending || state.queue.is_empty() {
            return;
        }
        if state.workers.len() < self.options.max_concurrent_workers
            && let Err(err) = self.spawn_worker(&mut state)
        {
            tracing::warn!(error = %err, "failed to spawn worker");
        }

        let cap = self.options.max_concurrent_calls_per_worker;
        let warmup_dispatch = self.options.warm_workers && !state.warmed_up;
        let state = &mut *state;
        for worker in state.workers.iter_mut() {
            if state.queue.is_empty() {
                break;
            }
            if !worker.has_capacity(cap) {
                continue;
            }
            let Some(call) = state.queue.pop_front() else {
                break;
            };
            worker.assign(call, warmup_dispatch);
        }
    }

    fn on_worker_ready(self: &Arc<Self>, id: WorkerId, protocol: u32, pid: u32) {
        {
            let Ok(mut state) = self.state_lock() else {
                return;
            };
            let Some(worker) = state.workers.iter_mut().find(|w| w.id == id) else {
                return;
            };
            if protocol != PROTOCOL_VERSION {
                tracing::warn!(
                    worker = id.0,
                    protocol,
                    "worker speaks an unexpected protocol version"
                );
            }
            worker.ready = true;
            tracing::debug!(worker = id.0, pid, "worker ready");
        }
        self.process_queue();
    }

    fn on_worker_response(self: &Arc<Self>, id: WorkerId, idx: u64, result: CallResult) {
        let call = {
            let Ok(mut state) = self.state_lock() else {
                return;
            };
            let state = &mut *state;
            let pending = match state.workers.iter_mut().find(|w| w.id == id) {
                Some(worker) => worker.calls.remove(&idx),
                None => {
                    tracing::debug!(worker = id.0, idx, "response from unknown worker");
                    return;
                }
            };
            let Some(pending) = pending else {
                tracing::debug!(worker = id.0, idx, "response for unknown call");
                return;
            };

            if pending.warmup_dispatch && !state.warmed_up {
                let total = state.workers.len();
                state.warm_workers = (state.warm_workers + 1).min(total);
                if state.warm_workers >= total {
                    state.warmed_up = true;
                    tracing::debug!("workers warmed up");
                    self.warmed.send_replace(true);
                }
            }
            pending.call
        };

        let _ = call.completer.send(result.into());
        self.process_queue();
    }

    /// Removes a worker, requeues its in-flight calls at the head of the
    /// queue, and waits the shutdown out. Idempotent.
    pub(crate) async fn stop_worker(self: &Arc<Self>, id: WorkerId) {
        let worker = {
            let Ok(mut state) = self.state_lock() else {
                return;
            };
            let Some(position) = state.workers.iter().position(|w| w.id == id) else {
                return;
            };
            let mut worker = state.workers.remove(position);
            worker.is_stopping = true;

            let mut orphaned: Vec<(u64, PendingCall)> = worker.calls.drain().collect();
            orphaned.sort_by_key(|(idx, _)| *idx);
            // Head placement: freshly failed calls run before newer
            // submissions so retries don't starve.
            for (_, pending) in orphaned {
                let mut call = pending.call;
                call.retries += 1;
                tracing::debug!(
                    method = %call.method,
                    retries = call.retries,
                    "requeueing orphaned call"
                );
                state.queue.push_front(call);
            }
            worker
        };

        tracing::warn!(worker = id.0, "stopping worker");
        worker.stop(self.options.forced_kill_time).await;
        self.process_queue();
    }

    /// Serves one request frame against parent-resident code.
    ///
    /// With a worker given, the response goes back down that worker's
    /// channel; without one (a direct master-call) the value is returned.
    /// When no response is awaited the outcome is discarded, errors
    /// included.
    pub(crate) async fn process_request(
        self: &Arc<Self>,
        call: MasterCall,
        worker: Option<WorkerId>,
    ) -> Result<Option<Value>, FarmError> {
        let idx = call.idx;
        let await_response = call.await_response;
        let outcome = self.invoke_request(call).await;

        if !await_response {
            if let Err(err) = &outcome {
                tracing::debug!(error = %err, "discarding failed fire-and-forget request");
            }
            return Ok(None);
        }

        match worker {
            Some(id) => {
                let Some(idx) = idx else {
                    tracing::warn!(worker = id.0, "awaited request without idx, dropping response");
                    return Ok(None);
                };
                let response = FarmMessage::Response {
                    idx,
                    result: outcome.into(),
                };
                let Ok(state) = self.state_lock() else {
                    return Ok(None);
                };
                match state.workers.iter().find(|w| w.id == id) {
                    Some(worker) => worker.send(response),
                    None => {
                        tracing::debug!(worker = id.0, idx, "worker gone before response was sent")
                    }
                }
                Ok(None)
            }
            None => outcome.map(Some),
        }
    }

    async fn invoke_request(self: &Arc<Self>, call: MasterCall) -> Result<Value, FarmError> {
        match call.target {
            CallTarget::Handle { id } => {
                if call.method.is_some() {
                    return Err(FarmError::invalid_request(
                        "reverse handles have no named methods",
                    ));
                }
                let target = self.handles.resolve(id)?;
                target(call.args).await
            }
            CallTarget::Location { path } => {
                let module = self.registry.resolve(&path)?;
                let ctx = WorkerContext::new(self.local_bridge());
                module.invoke(&ctx, call.method.as_deref(), call.args).await
            }
        }
    }

    /// Stops every worker in parallel and settles everything pending.
    pub(crate) async fn end(self: &Arc<Self>) -> Result<(), FarmError> {
        let (workers, abandoned) = {
            let mut state = self.state_lock()?;
            state.ending = true;
            let mut workers: Vec<Worker> = state.workers.drain(..).collect();
            let mut abandoned: Vec<Call> = state.queue.drain(..).collect();
            for worker in &mut workers {
                worker.is_stopping = true;
                let mut orphaned: Vec<(u64, PendingCall)> = worker.calls.drain().collect();
                orphaned.sort_by_key(|(idx, _)| *idx);
                for (_, pending) in orphaned {
                    abandoned.push(pending.call);
                }
            }
            (workers, abandoned)
        };

        // Settle abandoned calls so no caller is left hanging on a
        // future whose worker is being torn down.
        for call in abandoned {
            let _ = call.completer.send(Err(FarmError::new(
                ErrorCode::Ending,
                "worker farm ended before the call completed",
            )));
        }

        let forced_kill_time = self.options.forced_kill_time;
        futures::future::join_all(
            workers
                .into_iter()
                .map(|worker| worker.stop(forced_kill_time)),
        )
        .await;

        let mut state = self.state_lock()?;
        state.ending = false;
        Ok(())
    }

    fn local_bridge(self: &Arc<Self>) -> Arc<dyn MasterBridge> {
        Arc::new(LocalBridge {
            farm: Arc::downgrade(self),
        })
    }
}

/// [`MasterBridge`] for code running in the parent process: requests go
/// straight into the farm, log events straight to the forwarder.
struct LocalBridge {
    farm: Weak<FarmInner>,
}

#[async_trait]
impl MasterBridge for LocalBridge {
    async fn forward(&self, call: MasterCall) -> Result<Option<Value>, FarmError> {
        let Some(farm) = self.farm.upgrade() else {
            return Err(FarmError::internal("worker farm is gone"));
        };
        farm.process_request(call, None).await
    }

    fn forward_log(&self, envelope: LogEnvelope) {
        logs::forward(&envelope);
    }
}

/// Single event loop over every worker's inbound frames. Serializes all
/// state transitions; responses from one worker are handled in the order
/// the worker sent them.
async fn event_pump(farm: Weak<FarmInner>, mut events: UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(farm) = farm.upgrade() else {
            return;
        };
        match event {
            WorkerEvent::Message(id, WorkerMessage::Ready { protocol, pid }) => {
                farm.on_worker_ready(id, protocol, pid);
            }
            WorkerEvent::Message(id, WorkerMessage::Response { idx, result }) => {
                farm.on_worker_response(id, idx, result);
            }
            WorkerEvent::Message(id, WorkerMessage::Request(call)) => {
                // Reverse targets are user code; keep them off the pump.
                tokio::spawn(async move {
                    if let Err(err) = farm.process_request(call, Some(id)).await {
                        tracing::warn!(worker = id.0, error = %err, "worker request failed");
                    }
                });
            }
            WorkerEvent::Message(_, WorkerMessage::Log(envelope)) => {
                logs::forward(&envelope);
            }
            WorkerEvent::Exited(id) => {
                farm.stop_worker(id).await;
            }
        }
    }
}
