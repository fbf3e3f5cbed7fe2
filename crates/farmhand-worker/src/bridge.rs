use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use farmhand_core::{CallResult, FarmError, LogEnvelope, MasterBridge, MasterCall, WorkerMessage};
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

/// Child-side [`MasterBridge`] writing request frames onto the control
/// stream and matching response frames back by idx.
pub(crate) struct StreamBridge {
    outbound: UnboundedSender<WorkerMessage>,
    next_idx: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
}

impl StreamBridge {
    pub(crate) fn new(outbound: UnboundedSender<WorkerMessage>) -> Self {
        Self {
            outbound,
            next_idx: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Completes the pending master call with the given idx.
    pub(crate) fn complete(&self, idx: u64, result: CallResult) {
        let Ok(mut pending) = self.pending.lock() else {
            tracing::warn!(idx, "pending master-call table poisoned");
            return;
        };
        match pending.remove(&idx) {
            Some(done) => {
                let _ = done.send(result);
            }
            None => tracing::debug!(idx, "dropping unmatched master-call response"),
        }
    }

    fn register(&self, idx: u64, done: oneshot::Sender<CallResult>) -> Result<(), FarmError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| FarmError::internal("pending master-call table poisoned"))?;
        pending.insert(idx, done);
        Ok(())
    }

    fn forget(&self, idx: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&idx);
        }
    }
}

#[async_trait]
impl MasterBridge for StreamBridge {
    async fn forward(&self, mut call: MasterCall) -> Result<Option<Value>, FarmError> {
        if !call.await_response {
            call.idx = None;
            let _ = self.outbound.send(WorkerMessage::Request(call));
            return Ok(None);
        }

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.register(idx, done_tx)?;
        call.idx = Some(idx);

        if self.outbound.send(WorkerMessage::Request(call)).is_err() {
            self.forget(idx);
            return Err(FarmError::channel_closed("control stream closed"));
        }

        match done_rx.await {
            Ok(CallResult::Data(value)) => Ok(Some(value)),
            Ok(CallResult::Error(err)) => Err(err),
            Err(_) => Err(FarmError::channel_closed(
                "control stream closed before the response arrived",
            )),
        }
    }

    fn forward_log(&self, envelope: LogEnvelope) {
        let _ = self.outbound.send(WorkerMessage::Log(envelope));
    }
}
