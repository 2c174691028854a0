use crate::executor::{Executor, ExecutorError};
use parking_lot::{RwLock, const_rwlock};
use std::sync::Arc;

static INSTANCE: RwLock<Option<Arc<Executor>>> = const_rwlock(None);

/// The process-wide executor, created with one worker per hardware thread on
/// first use.
///
/// # Errors
/// [`ExecutorError::Spawn`] if the executor has to be created and a worker
/// thread cannot be started.
pub fn instance() -> Result<Arc<Executor>, ExecutorError> {
    let slot = INSTANCE.read();
    if let Some(executor) = slot.as_ref() {
        return Ok(Arc::clone(executor));
    }
    drop(slot);

    let mut slot = INSTANCE.write();
    if let Some(executor) = slot.as_ref() {
        return Ok(Arc::clone(executor));
    }
    let executor = Arc::new(Executor::new(0)?);
    *slot = Some(Arc::clone(&executor));
    Ok(executor)
}

/// Make `executor` the process-wide executor and return the previous one.
pub fn install(executor: Executor) -> Option<Arc<Executor>> {
    INSTANCE.write().replace(Arc::new(executor))
}

/// Remove the process-wide executor. It shuts down once the last clone of
/// the returned `Arc` is dropped, which must not happen inside one of its
/// own jobs.
pub fn shutdown() -> Option<Arc<Executor>> {
    INSTANCE.write().take()
}
