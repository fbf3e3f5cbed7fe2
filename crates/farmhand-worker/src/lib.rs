//! Child-side worker runtime: serves a control stream, executes registry
//! methods, and routes reverse/master calls back into the parent.

mod bridge;

use std::{
    os::fd::{FromRawFd, RawFd},
    sync::{Arc, OnceLock},
};

use clap::Parser;
use farmhand_core::{
    CallArg, FarmMessage, MasterBridge, ModuleRegistry, PROTOCOL_VERSION, WorkerContext,
    WorkerMessage,
};
use farmhand_ipc::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, IpcError};
use thiserror::Error;
use tokio::{
    net::UnixStream,
    sync::mpsc::{self, UnboundedSender},
    task::JoinSet,
};

use crate::bridge::StreamBridge;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Module id this worker executes dispatched calls against.
    pub module: String,
    /// Frame payload cap, inherited from the farm's configuration.
    pub max_frame_size: u32,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("invalid control socket fd {fd}: {source}")]
    InvalidControlFd { fd: RawFd, source: std::io::Error },
    #[error("failed to convert worker control stream: {0}")]
    ControlStream(std::io::Error),
    #[error("control stream disconnected")]
    Disconnected,
    #[error("a worker method panicked")]
    CallPanicked,
}

static MASTER_ENDPOINT: OnceLock<Arc<dyn MasterBridge>> = OnceLock::new();

/// The process-wide route back into the parent, present only in processes
/// started as workers. The parent process never installs one, which is
/// how the two sides are told apart.
pub fn master_endpoint() -> Option<Arc<dyn MasterBridge>> {
    MASTER_ENDPOINT.get().cloned()
}

/// Converts the control fd inherited from the parent into a stream.
pub fn control_stream_from_fd(fd: RawFd) -> Result<UnixStream, WorkerError> {
    if fd < 0 {
        return Err(WorkerError::InvalidControlFd {
            fd,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "fd must be >= 0"),
        });
    }
    // SAFETY: fd comes from the parent process and is expected to be a valid unix socket fd.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .map_err(|source| WorkerError::InvalidControlFd { fd, source })?;
    UnixStream::from_std(std_stream).map_err(WorkerError::ControlStream)
}

/// Argv accepted by worker binaries; the parent passes these at spawn.
#[derive(Debug, Parser)]
#[command(name = "farmhand-worker", about = "Farmhand worker child runtime")]
pub struct WorkerArgs {
    /// Inherited control socket fd.
    #[arg(long)]
    pub control_fd: i32,
    /// Module id to execute dispatched calls against.
    #[arg(long)]
    pub module: String,
    /// Frame payload cap in bytes, matching the parent's.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: u32,
}

/// Entry point for embedder worker binaries: parse argv, install the
/// master endpoint, serve until the parent ends the worker.
pub async fn run(registry: Arc<ModuleRegistry>) -> Result<(), WorkerError> {
    run_with_args(WorkerArgs::parse(), registry).await
}

pub async fn run_with_args(
    args: WorkerArgs,
    registry: Arc<ModuleRegistry>,
) -> Result<(), WorkerError> {
    let stream = control_stream_from_fd(args.control_fd)?;
    tracing::info!(module = %args.module, "starting farmhand worker");
    let config = WorkerConfig {
        module: args.module,
        max_frame_size: args.max_frame_size,
    };
    serve_inner(stream, registry, config, true).await
}

/// Serves one control stream without touching process-global state.
///
/// This is the in-process worker entry: the farm runs it on a task over
/// its half of a socketpair when no worker binary is configured.
pub async fn serve(
    stream: UnixStream,
    registry: Arc<ModuleRegistry>,
    config: WorkerConfig,
) -> Result<(), WorkerError> {
    serve_inner(stream, registry, config, false).await
}

async fn serve_inner(
    stream: UnixStream,
    registry: Arc<ModuleRegistry>,
    config: WorkerConfig,
    publish_endpoint: bool,
) -> Result<(), WorkerError> {
    let codec = FrameCodec::with_max_frame_size(config.max_frame_size);
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(err) = codec.write_message(&mut write_half, &message).await {
                if !err.is_channel_closed() {
                    tracing::warn!(error = %err, "worker write failed");
                }
                return;
            }
        }
    });

    // Frames come in through a dedicated task: a select branch must be
    // safe to drop, and a half-read frame is not.
    let (inbound, mut inbound_rx) = mpsc::unbounded_channel::<FarmMessage>();
    let mut reader = tokio::spawn(async move {
        loop {
            match codec.read_message::<_, FarmMessage>(&mut read_half).await {
                Ok(message) => {
                    if inbound.send(message).is_err() {
                        return Ok(());
                    }
                }
                Err(err) if err.is_channel_closed() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    });

    let bridge = Arc::new(StreamBridge::new(outbound.clone()));
    if publish_endpoint {
        let _ = MASTER_ENDPOINT.set(bridge.clone());
    }
    let ctx = WorkerContext::new(bridge.clone());

    outbound
        .send(WorkerMessage::Ready {
            protocol: PROTOCOL_VERSION,
            pid: std::process::id(),
        })
        .map_err(|_| WorkerError::Disconnected)?;

    // In-flight calls live in the set so dropping it aborts them: a panic
    // in user code tears the whole worker down, in-process workers
    // included, and the parent redistributes whatever was in flight.
    let mut calls: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            message = inbound_rx.recv() => match message {
                Some(FarmMessage::Call { idx, method, args }) => {
                    calls.spawn(run_call(
                        registry.clone(),
                        config.module.clone(),
                        ctx.clone(),
                        outbound.clone(),
                        idx,
                        method,
                        args,
                    ));
                }
                Some(FarmMessage::Response { idx, result }) => bridge.complete(idx, result),
                Some(FarmMessage::End {}) => {
                    reader.abort();
                    return Ok(());
                }
                None => {
                    // Reader finished: clean disconnect or a read error.
                    return match (&mut reader).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(WorkerError::Ipc(err)),
                        Err(_) => Err(WorkerError::Disconnected),
                    };
                }
            },
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(err) = joined
                    && err.is_panic()
                {
                    tracing::error!("worker method panicked, shutting down");
                    reader.abort();
                    return Err(WorkerError::CallPanicked);
                }
            }
        }
    }
}

async fn run_call(
    registry: Arc<ModuleRegistry>,
    module: String,
    ctx: WorkerContext,
    outbound: UnboundedSender<WorkerMessage>,
    idx: u64,
    method: String,
    args: Vec<CallArg>,
) {
    let outcome = async {
        let module = registry.resolve(&module)?;
        module.invoke(&ctx, Some(&method), args).await
    }
    .await;

    let _ = outbound.send(WorkerMessage::Response {
        idx,
        result: outcome.into(),
    });
}
