//! Starting, resizing and stopping a [`Subsystem`].

pub mod handle;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};

use tracing::{debug, error, info};

use self::handle::SubsystemHandle;
use super::{
    completion,
    data_source::FormatCache,
    flush::{self, FlushCoordinator},
    queue::{WorkItem, WorkQueue},
    slots::OpPool,
    worker::WorkerPool,
};
use crate::{
    engine::Engine,
    metrics::{MetricsStorage, GLOBAL_STORAGE},
    ops::OpState,
    Error,
};

/// Default number of op slots.
pub const DEFAULT_POOL_SIZE: usize = 4096;
/// Upper bound on [`AsyncConfig::worker_count`].
pub const MAX_WORKERS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncConfig {
    pub pool_size: usize,
    /// `1..=MAX_WORKERS`.
    pub worker_count: usize,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        AsyncConfig {
            pool_size: DEFAULT_POOL_SIZE,
            worker_count: *crate::env_tunables::DEFAULT_WORKER_COUNT,
        }
    }
}

impl AsyncConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_size == 0 || u32::try_from(self.pool_size).is_err() {
            return Err(Error::InvalidConfig(format!(
                "pool_size must be in 1..=u32::MAX, got {}",
                self.pool_size
            )));
        }
        validate_worker_count(self.worker_count)
    }
}

fn validate_worker_count(n: usize) -> Result<(), Error> {
    if !(1..=MAX_WORKERS).contains(&n) {
        return Err(Error::InvalidConfig(format!(
            "worker_count must be in 1..={MAX_WORKERS}, got {n}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Default)]
pub(crate) struct StartTesting {
    pub(crate) fail_spawn_of_worker: Option<usize>,
}

/// A running async subsystem. Use [`Self::start`] to start, then [`SubsystemHandle`] to interact.
pub struct Subsystem {
    pub(crate) id: usize,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) pool: OpPool,
    pub(crate) queue: WorkQueue,
    pub(crate) flush: FlushCoordinator,
    pub(crate) formats: FormatCache,
    pub(crate) workers: Mutex<WorkerPool>,
    lifecycle: Mutex<LifecycleState>,
    lifecycle_changed: Condvar,
    pub(crate) metrics: &'static MetricsStorage,
}

static SUBSYSTEM_ID: AtomicUsize = AtomicUsize::new(0);

impl Subsystem {
    /// Allocate the op pool and spawn the worker threads.
    ///
    /// If any worker fails to spawn, the ones already running are stopped
    /// and joined before the error is returned.
    pub fn start(engine: Arc<dyn Engine>, config: AsyncConfig) -> Result<SubsystemHandle, Error> {
        Self::start_with_testing(engine, config, None, &GLOBAL_STORAGE)
    }

    pub(crate) fn start_with_testing(
        engine: Arc<dyn Engine>,
        config: AsyncConfig,
        testing: Option<StartTesting>,
        metrics: &'static MetricsStorage,
    ) -> Result<SubsystemHandle, Error> {
        config.validate()?;
        let id = SUBSYSTEM_ID.fetch_add(1, Ordering::Relaxed);

        info!(system = id, ?config, "subsystem start");
        scopeguard::defer_on_unwind! {error!(system = id, "subsystem start panic")};

        let core = Arc::new(Subsystem {
            id,
            engine,
            pool: OpPool::new(id, config.pool_size, metrics),
            queue: WorkQueue::new(),
            flush: FlushCoordinator::new(config.worker_count),
            formats: FormatCache::default(),
            workers: Mutex::new(WorkerPool::new()),
            lifecycle: Mutex::new(LifecycleState::Uninitialized),
            lifecycle_changed: Condvar::new(),
            metrics,
        });

        {
            let core_ref = &core;
            let mut workers = scopeguard::guard(WorkerPool::new(), move |mut workers| {
                debug!(system = id, spawned = workers.len(), "unwinding partial start");
                core_ref.queue.close();
                workers.join_all();
                core_ref.set_state(LifecycleState::Stopped);
            });
            for _ in 0..config.worker_count {
                workers.spawn(core_ref, testing.as_ref())?;
            }
            *core.workers.lock().unwrap() = scopeguard::ScopeGuard::into_inner(workers);
        }

        core.set_state(LifecycleState::Running);
        metrics.subsystems_started.fetch_add(1, Ordering::Relaxed);
        info!(system = id, "subsystem running");
        Ok(SubsystemHandle::new(core))
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.lifecycle.lock().unwrap()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.lifecycle.lock().unwrap() = state;
        self.lifecycle_changed.notify_all();
    }

    /// Idempotent; concurrent callers return once the subsystem is `Stopped`.
    pub(crate) fn shutdown(&self) {
        assert!(
            !flush::on_worker_thread(),
            "shutdown must not be called from a completion callback"
        );
        {
            let mut state = self.lifecycle.lock().unwrap();
            match *state {
                LifecycleState::Running => *state = LifecycleState::ShuttingDown,
                LifecycleState::ShuttingDown => {
                    let _state = self
                        .lifecycle_changed
                        .wait_while(state, |s| *s != LifecycleState::Stopped)
                        .unwrap();
                    return;
                }
                LifecycleState::Stopped => return,
                LifecycleState::Uninitialized => {
                    unreachable!("implementation error: handle to an unstarted subsystem")
                }
            }
        }
        info!(system = self.id, "shutdown start");
        scopeguard::defer_on_success! {info!(system = self.id, "shutdown end")};
        scopeguard::defer_on_unwind! {error!(system = self.id, "shutdown panic")};

        self.pool.close_for_allocation();

        let drained = self.queue.close();
        debug!(system = self.id, drained = drained.len(), "queue closed");
        for item in drained {
            match item {
                WorkItem::Op(slot_ref) => completion::cancel(self, slot_ref, OpState::Enqueued),
                WorkItem::Flush { generation } => self.flush.sentinel_drained(generation),
            }
        }

        // workers finish the op they are executing, then see the closed queue
        self.workers.lock().unwrap().join_all();
        self.flush.workers_gone();

        let ready = self.pool.ready_slots();
        debug!(system = self.id, unsubmitted = ready.len(), "cancelling unsubmitted ops");
        for slot_ref in ready {
            completion::cancel(self, slot_ref, OpState::Ready);
        }
        self.pool.debug_dump();

        self.set_state(LifecycleState::Stopped);
        self.metrics
            .subsystems_stopped
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Grow or shrink the worker pool. Waits for pending flushes first.
    pub(crate) fn reconfigure(self: &Arc<Self>, worker_count: usize) -> Result<(), Error> {
        validate_worker_count(worker_count)?;
        if flush::on_worker_thread() {
            return Err(Error::ReconfigureFromCallback);
        }
        if self.state() != LifecycleState::Running {
            return Err(Error::SubsystemNotRunning);
        }
        let mut workers = self.workers.lock().unwrap();
        self.flush.resize(|| {
            let current = workers.len();
            info!(system = self.id, current, target = worker_count, "reconfigure");
            let res = if worker_count > current {
                (current..worker_count).try_for_each(|_| workers.spawn(self, None))
            } else {
                workers.retire(current - worker_count, self);
                Ok(())
            };
            (workers.len(), res)
        })
    }
}
