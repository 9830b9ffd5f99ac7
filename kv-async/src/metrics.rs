use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    pub subsystems_started: u64,
    pub subsystems_stopped: u64,
    pub workers_spawned: u64,
    pub workers_exited: u64,
    pub ops_allocated: u64,
    pub ops_completed: u64,
    pub ops_cancelled: u64,
    pub alloc_exhausted: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) subsystems_started: AtomicU64,
    pub(crate) subsystems_stopped: AtomicU64,
    pub(crate) workers_spawned: AtomicU64,
    pub(crate) workers_exited: AtomicU64,
    pub(crate) ops_allocated: AtomicU64,
    pub(crate) ops_completed: AtomicU64,
    pub(crate) ops_cancelled: AtomicU64,
    pub(crate) alloc_exhausted: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            subsystems_started: AtomicU64::new(0),
            subsystems_stopped: AtomicU64::new(0),
            workers_spawned: AtomicU64::new(0),
            workers_exited: AtomicU64::new(0),
            ops_allocated: AtomicU64::new(0),
            ops_completed: AtomicU64::new(0),
            ops_cancelled: AtomicU64::new(0),
            alloc_exhausted: AtomicU64::new(0),
        }
    }

    pub(crate) fn make_pub(&self) -> Metrics {
        Metrics {
            subsystems_started: self.subsystems_started.load(Ordering::Relaxed),
            subsystems_stopped: self.subsystems_stopped.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_exited: self.workers_exited.load(Ordering::Relaxed),
            ops_allocated: self.ops_allocated.load(Ordering::Relaxed),
            ops_completed: self.ops_completed.load(Ordering::Relaxed),
            ops_cancelled: self.ops_cancelled.load(Ordering::Relaxed),
            alloc_exhausted: self.alloc_exhausted.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

/// Process-wide counters, summed over every [`Subsystem`](crate::Subsystem).
pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}
