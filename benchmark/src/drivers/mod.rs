pub(crate) mod std_thread;
pub(crate) mod tokio_tasks;

use kv_async::{engine::EngineError, OpError, OpResult};

/// Searches for keys that are not there yet are expected in mixed workloads.
fn is_failure(result: &OpResult) -> bool {
    !matches!(result, Ok(()) | Err(OpError::Engine(EngineError::NotFound)))
}
