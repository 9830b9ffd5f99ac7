//! Owned handle to a [`Subsystem::start`](crate::Subsystem::start)ed subsystem.

use std::sync::Arc;

use tracing::trace;

use super::{LifecycleState, Subsystem};
use crate::{ops::callback::Callback, Error, OpHandle};

/// Owned handle to the [`Subsystem`](crate::Subsystem) created by
/// [`Subsystem::start`](crate::Subsystem::start).
///
/// Dropping the handle shuts the subsystem down, see [`Self::shutdown`].
///
/// This handle is [`Send`] and [`Sync`] but not [`Clone`]. Share it between
/// threads by reference or through an `Arc`.
pub struct SubsystemHandle {
    inner: Arc<Subsystem>,
}

impl SubsystemHandle {
    pub(crate) fn new(inner: Arc<Subsystem>) -> Self {
        SubsystemHandle { inner }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Subsystem> {
        &self.inner
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Claim an op slot bound to the data source at `uri`.
    ///
    /// `config` is a comma-separated list of `overwrite[=bool]` (default on),
    /// `raw[=bool]` and `dump=hex|print`. The key and value formats are
    /// looked up from the engine once per `(uri, config)` pair and cached.
    ///
    /// Fails with [`Error::AllocationExhausted`] if every slot is in use;
    /// this is not fatal, retry once some ops have completed.
    pub fn allocate(
        &self,
        uri: &str,
        config: &str,
        callback: Arc<dyn Callback>,
    ) -> Result<OpHandle, Error> {
        if self.inner.state() != LifecycleState::Running {
            return Err(Error::SubsystemNotRunning);
        }
        let source = self
            .inner
            .formats
            .get_or_insert(&*self.inner.engine, uri, config)?;
        let slot_ref = self.inner.pool.allocate(source, callback)?;
        trace!(id = slot_ref.unique_id, idx = slot_ref.idx, uri, "allocate");
        Ok(OpHandle::new(Arc::clone(&self.inner), slot_ref))
    }

    /// Block until every op submitted before this call has completed.
    ///
    /// Concurrent flushes are served in call order. Returns
    /// [`Error::SubsystemNotRunning`] if shutdown cancelled the flush, after
    /// all ops ahead of it have completed or been cancelled.
    pub fn flush(&self) -> Result<(), Error> {
        if self.inner.state() != LifecycleState::Running {
            return Err(Error::SubsystemNotRunning);
        }
        self.inner.flush.flush(&self.inner.queue)
    }

    /// Stop the subsystem.
    ///
    /// After the call to this function returns, it is guaranteed that all
    /// subsequent attempts to allocate or submit ops fail with
    /// [`Error::SubsystemNotRunning`].
    ///
    /// Ops a worker is executing run to completion. Ops still queued, and ops
    /// allocated but not yet submitted, are completed with
    /// [`OpError::Cancelled`](crate::OpError::Cancelled). Returns once every
    /// worker thread has been joined.
    ///
    /// Calling this more than once is fine; concurrent callers all wait for
    /// the first one to finish.
    ///
    /// # Panics
    ///
    /// If called from a completion callback.
    pub fn shutdown(&self) {
        self.inner.shutdown()
    }

    /// Resize the worker pool to `worker_count` threads (`1..=`[`MAX_WORKERS`](crate::MAX_WORKERS)).
    ///
    /// Waits for pending flushes to finish first.
    pub fn reconfigure(&self, worker_count: usize) -> Result<(), Error> {
        self.inner.reconfigure(worker_count)
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.flush.active_workers()
    }

    /// Number of op slots.
    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Ops queued or executing right now.
    pub fn outstanding(&self) -> usize {
        self.inner.queue.flush_count()
    }

    /// Log how many op slots are in which state, at debug level.
    pub fn debug_dump(&self) {
        self.inner.pool.debug_dump();
    }
}

impl Drop for SubsystemHandle {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
