//! Process-local worker farm: multiplexes asynchronous method calls
//! across a pool of child-process workers, with an in-parent fallback
//! path used while the remote workers warm up.
//!
//! Workers speak a framed CBOR protocol over an inherited socketpair and
//! can call back into the parent through reverse handles and master
//! calls; log events emitted inside workers replay on the parent logger.

mod farm;
mod handle;
mod logs;
mod options;
mod shared;
mod worker;

pub use farm::{Farm, MethodCaller};
pub use options::{
    FarmOptions, MAX_CONCURRENT_CALLS_ENV, WORKER_BIN_ENV, WORKERS_ENV, default_calls_per_worker,
    default_worker_count,
};
pub use shared::{
    call_master, create_reverse_handle, get_concurrent_calls_per_worker, get_num_workers,
    get_shared, is_worker, shared,
};

pub use farmhand_core::{
    CallArg, CallTarget, ErrorCode, FarmError, Handle, HandleId, LogLevel, MasterCall,
    MethodTable, ModuleRegistry, WorkerContext, WorkerModule,
};
