use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
};

use farmhand_core::{FarmError, Handle, MasterCall};
use serde_json::Value;

use crate::{
    farm::Farm,
    options::{FarmOptions, default_calls_per_worker, default_worker_count},
};

static SHARED: Mutex<Option<Farm>> = Mutex::new(None);

fn shared_lock() -> Result<MutexGuard<'static, Option<Farm>>, FarmError> {
    SHARED
        .lock()
        .map_err(|_| FarmError::internal("shared farm slot poisoned"))
}

/// The process-wide farm, if one is running.
pub fn shared() -> Result<Option<Farm>, FarmError> {
    Ok(shared_lock()?.clone())
}

/// Returns the process-wide farm, constructing one on first use.
///
/// Options naming a different worker path than the running instance end
/// that instance and replace it; options matching it are ignored.
pub async fn get_shared(options: Option<FarmOptions>) -> Result<Farm, FarmError> {
    let (previous, options) = {
        let mut slot = shared_lock()?;
        match (slot.as_ref(), options) {
            (Some(farm), None) => return Ok(farm.clone()),
            (Some(farm), Some(options)) => {
                if options.worker_path.as_deref() == Some(farm.worker_path()) {
                    return Ok(farm.clone());
                }
                (slot.take(), Some(options))
            }
            (None, options) => (None, options),
        }
    };

    if let Some(previous) = previous {
        previous.end().await?;
    }

    let farm = Farm::new(options.unwrap_or_default())?;
    *shared_lock()? = Some(farm.clone());
    Ok(farm)
}

/// Clears the slot if it still holds this instance.
pub(crate) fn release(farm: &Farm) {
    let Ok(mut slot) = SHARED.lock() else {
        return;
    };
    if slot.as_ref().is_some_and(|current| Farm::ptr_eq(current, farm)) {
        *slot = None;
    }
}

/// True when this process was started as a worker.
pub fn is_worker() -> bool {
    farmhand_worker::master_endpoint().is_some()
}

/// Sends one request into the parent.
///
/// From a worker process this routes over the control stream the child
/// runtime installed at startup; from the parent it goes straight to the
/// shared farm. Without `await_response` the outcome is discarded.
pub async fn call_master(
    mut call: MasterCall,
    await_response: bool,
) -> Result<Option<Value>, FarmError> {
    call.await_response = await_response;
    if let Some(endpoint) = farmhand_worker::master_endpoint() {
        return endpoint.forward(call).await;
    }
    let farm =
        shared()?.ok_or_else(|| FarmError::not_found("no shared worker farm is running"))?;
    farm.process_request(call).await
}

/// Registers a parent-side function on the shared farm. Fails from a
/// worker process: the function would not live where handles resolve.
pub fn create_reverse_handle<F, Fut>(f: F) -> Result<Handle, FarmError>
where
    F: Fn(Vec<farmhand_core::CallArg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FarmError>> + Send + 'static,
{
    if is_worker() {
        return Err(FarmError::invalid_request(
            "reverse handles can only be created in the parent process",
        ));
    }
    let farm =
        shared()?.ok_or_else(|| FarmError::not_found("no shared worker farm is running"))?;
    Ok(farm.create_reverse_handle(f))
}

/// Effective remote worker count: the shared farm's, else the default.
pub fn get_num_workers() -> usize {
    match shared() {
        Ok(Some(farm)) => farm.options().max_concurrent_workers,
        _ => default_worker_count(),
    }
}

/// Effective per-worker call cap: the shared farm's, else the default.
pub fn get_concurrent_calls_per_worker() -> usize {
    match shared() {
        Ok(Some(farm)) => farm.options().max_concurrent_calls_per_worker,
        _ => default_calls_per_worker(),
    }
}
