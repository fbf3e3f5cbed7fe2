use std::{num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};

use farmhand_core::ModuleRegistry;
use farmhand_ipc::DEFAULT_MAX_FRAME_SIZE;

/// Overrides the remote worker count default.
pub const WORKERS_ENV: &str = "PARCEL_WORKERS";
/// Overrides the per-worker in-flight call cap default.
pub const MAX_CONCURRENT_CALLS_ENV: &str = "PARCEL_MAX_CONCURRENT_CALLS";
/// Overrides the worker binary path; when neither this nor `worker_bin`
/// names an existing binary, workers run in-process.
pub const WORKER_BIN_ENV: &str = "FARMHAND_WORKER_BIN";

const DEFAULT_MAX_CONCURRENT_CALLS: usize = 5;

/// Farm configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct FarmOptions {
    /// Upper bound on remote workers.
    pub max_concurrent_workers: usize,
    /// Per-worker in-flight call cap.
    pub max_concurrent_calls_per_worker: usize,
    /// Grace period between the shutdown request and a forced kill.
    pub forced_kill_time: Duration,
    /// Allow in-parent execution while remote workers warm up.
    pub use_local_worker: bool,
    /// Shadow-dispatch local calls remotely to prime worker caches.
    pub warm_workers: bool,
    /// Registry id of the user worker module. Required.
    pub worker_path: Option<String>,
    /// Worker binary to spawn; in-process workers when absent.
    pub worker_bin: Option<PathBuf>,
    /// Cap on a single call or response frame's payload. Workers inherit
    /// the value at spawn so both ends of the channel agree.
    pub max_frame_size: u32,
    /// Handler modules, provided by the embedder at startup.
    pub modules: Arc<ModuleRegistry>,
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_worker_count(),
            max_concurrent_calls_per_worker: default_calls_per_worker(),
            forced_kill_time: Duration::from_millis(100),
            use_local_worker: true,
            warm_workers: true,
            worker_path: None,
            worker_bin: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            modules: Arc::new(ModuleRegistry::new()),
        }
    }
}

/// Default remote worker count: env override, else machine parallelism.
pub fn default_worker_count() -> usize {
    env_count(WORKERS_ENV).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    })
}

/// Default per-worker call cap: env override, else 5.
pub fn default_calls_per_worker() -> usize {
    env_count(MAX_CONCURRENT_CALLS_ENV).unwrap_or(DEFAULT_MAX_CONCURRENT_CALLS)
}

fn env_count(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}
