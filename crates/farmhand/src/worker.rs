use std::{
    collections::HashMap,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use farmhand_core::{FarmError, FarmMessage, ModuleRegistry, WorkerId, WorkerMessage};
use farmhand_ipc::{FrameCodec, IpcError};
use farmhand_worker::WorkerConfig;
use tokio::{
    net::{UnixStream, unix::OwnedReadHalf},
    process::{Child, Command},
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
    time::timeout,
};

use crate::{farm::Call, options::WORKER_BIN_ENV};

/// Events surfaced by a worker's reader task onto the farm's event loop.
pub(crate) enum WorkerEvent {
    Message(WorkerId, WorkerMessage),
    Exited(WorkerId),
}

/// A call assigned to a worker, waiting for its response frame.
pub(crate) struct PendingCall {
    pub(crate) call: Call,
    /// Completion feeds the warmup counter when set.
    pub(crate) warmup_dispatch: bool,
}

/// Parent-side controller for one child: owns the process (or in-process
/// serve task), the outbound frame queue, and the per-worker call table.
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    runtime: WorkerRuntime,
    outbound: UnboundedSender<FarmMessage>,
    reader: JoinHandle<()>,
    pub(crate) ready: bool,
    pub(crate) is_stopping: bool,
    pub(crate) stopped: bool,
    pub(crate) calls: HashMap<u64, PendingCall>,
    next_idx: u64,
}

/// Worker execution model.
enum WorkerRuntime {
    /// Dedicated OS process speaking over an inherited socketpair fd.
    Process(Child),
    /// In-process serve task, used when no worker binary is available.
    InProcess(JoinHandle<Result<(), farmhand_worker::WorkerError>>),
}

impl Worker {
    /// Forks a worker and wires up its reader and writer tasks.
    ///
    /// Non-blocking: the worker is not usable until its readiness frame
    /// arrives as a [`WorkerEvent::Message`].
    pub(crate) fn spawn(
        id: WorkerId,
        module: &str,
        worker_bin: Option<&Path>,
        max_frame_size: u32,
        registry: Arc<ModuleRegistry>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Worker, FarmError> {
        let codec = FrameCodec::with_max_frame_size(max_frame_size);
        let (parent_std, child_std) =
            std::os::unix::net::UnixStream::pair().map_err(|err| {
                FarmError::internal("create worker socketpair").with_detail(err.to_string())
            })?;
        parent_std.set_nonblocking(true).map_err(|err| {
            FarmError::internal("configure worker socketpair").with_detail(err.to_string())
        })?;
        let parent_stream = UnixStream::from_std(parent_std).map_err(|err| {
            FarmError::internal("convert worker socket").with_detail(err.to_string())
        })?;

        let runtime = match resolve_worker_bin(worker_bin) {
            Some(bin) => {
                let child_fd = child_std.as_raw_fd();
                clear_close_on_exec(child_fd)?;
                let mut command = Command::new(&bin);
                command
                    .arg("--control-fd")
                    .arg(child_fd.to_string())
                    .arg("--module")
                    .arg(module)
                    .arg("--max-frame-size")
                    .arg(max_frame_size.to_string());
                let child = command.spawn().map_err(|err| {
                    FarmError::internal("spawn worker binary")
                        .with_detail(format!("{}: {err}", bin.display()))
                })?;
                drop(child_std);
                WorkerRuntime::Process(child)
            }
            None => {
                child_std.set_nonblocking(true).map_err(|err| {
                    FarmError::internal("configure worker socketpair").with_detail(err.to_string())
                })?;
                let child_stream = UnixStream::from_std(child_std).map_err(|err| {
                    FarmError::internal("convert in-process worker socket")
                        .with_detail(err.to_string())
                })?;
                let config = WorkerConfig {
                    module: module.to_string(),
                    max_frame_size,
                };
                let task =
                    tokio::spawn(
                        async move { farmhand_worker::serve(child_stream, registry, config).await },
                    );
                WorkerRuntime::InProcess(task)
            }
        };

        let (read_half, mut write_half) = parent_stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<FarmMessage>();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = codec.write_message(&mut write_half, &message).await {
                    if !err.is_channel_closed() {
                        tracing::warn!(worker = id.0, error = %err, "worker write failed");
                    }
                    return;
                }
            }
        });
        let reader = tokio::spawn(read_loop(id, codec, read_half, events));

        Ok(Worker {
            id,
            runtime,
            outbound,
            reader,
            ready: false,
            is_stopping: false,
            stopped: false,
            calls: HashMap::new(),
            next_idx: 0,
        })
    }

    pub(crate) fn has_capacity(&self, cap: usize) -> bool {
        self.ready && !self.is_stopping && !self.stopped && self.calls.len() < cap
    }

    /// Moves a queued call into this worker's table and sends its frame.
    pub(crate) fn assign(&mut self, call: Call, warmup_dispatch: bool) {
        let idx = self.next_idx;
        self.next_idx += 1;
        let frame = FarmMessage::Call {
            idx,
            method: call.method.clone(),
            args: call.args.clone(),
        };
        self.calls.insert(
            idx,
            PendingCall {
                call,
                warmup_dispatch,
            },
        );
        if self.outbound.send(frame).is_err() {
            tracing::debug!(worker = self.id.0, idx, "worker outbound closed during assign");
        }
    }

    /// Sends an out-of-band frame, e.g. the response to a reverse call.
    pub(crate) fn send(&self, message: FarmMessage) {
        let _ = self.outbound.send(message);
    }

    /// Requests shutdown, then force-kills once the grace period passes.
    /// Always completes.
    pub(crate) async fn stop(mut self, forced_kill_time: Duration) {
        self.stopped = true;
        let _ = self.outbound.send(FarmMessage::End {});
        match self.runtime {
            WorkerRuntime::Process(mut child) => {
                if timeout(forced_kill_time, child.wait()).await.is_err() {
                    tracing::warn!(worker = self.id.0, "worker did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
            WorkerRuntime::InProcess(mut task) => {
                match timeout(forced_kill_time, &mut task).await {
                    Ok(Ok(Err(err))) => {
                        tracing::debug!(worker = self.id.0, error = %err, "worker exited with error")
                    }
                    Ok(_) => {}
                    Err(_) => {
                        tracing::warn!(worker = self.id.0, "worker did not exit in time, aborting");
                        task.abort();
                    }
                }
            }
        }
        self.reader.abort();
    }
}

async fn read_loop(
    id: WorkerId,
    codec: FrameCodec,
    mut read_half: OwnedReadHalf,
    events: UnboundedSender<WorkerEvent>,
) {
    loop {
        match codec.read_message::<_, WorkerMessage>(&mut read_half).await {
            Ok(message) => {
                if events.send(WorkerEvent::Message(id, message)).is_err() {
                    return;
                }
            }
            Err(err) if err.is_channel_closed() => {
                let _ = events.send(WorkerEvent::Exited(id));
                return;
            }
            Err(IpcError::Decode(reason)) => {
                tracing::warn!(worker = id.0, %reason, "dropping undecodable worker frame");
            }
            Err(err) => {
                tracing::warn!(worker = id.0, error = %err, "worker read failed");
                let _ = events.send(WorkerEvent::Exited(id));
                return;
            }
        }
    }
}

/// Picks the worker binary: env override first, then the configured path
/// when it exists. `None` selects the in-process runtime.
fn resolve_worker_bin(configured: Option<&Path>) -> Option<PathBuf> {
    if let Ok(value) = std::env::var(WORKER_BIN_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    configured
        .filter(|bin| bin.exists())
        .map(Path::to_path_buf)
}

/// Clears `FD_CLOEXEC` for an inherited fd passed to the worker process.
fn clear_close_on_exec(fd: i32) -> Result<(), FarmError> {
    // SAFETY: fcntl is called with valid command constants and the provided fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(FarmError::internal("read worker fd flags")
            .with_detail(std::io::Error::last_os_error().to_string()));
    }
    // SAFETY: fcntl is called with valid command constants and the provided fd.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(FarmError::internal("clear worker fd close-on-exec")
            .with_detail(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}
