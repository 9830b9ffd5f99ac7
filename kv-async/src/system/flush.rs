//! The flush barrier.
//!
//! A flush pushes one [`WorkItem::Flush`] sentinel per active worker, all in
//! a single queue critical section, so every op enqueued before the flush sits
//! in front of all of them. A worker that pops a sentinel parks at the
//! barrier until every sentinel of that generation has been popped. Hence
//! each worker consumes exactly one sentinel, and by the time the last one
//! arrives every earlier op has been completed by the worker that took it.
//!
//! Lock order: flush lock, then queue lock.

use std::{
    cell::Cell,
    collections::BTreeMap,
    sync::{Condvar, Mutex},
};

use tracing::{debug, trace};

use super::queue::{WorkItem, WorkQueue};
use crate::Error;

thread_local! {
    static ON_WORKER_THREAD: Cell<bool> = Cell::new(false);
}

/// Called once by every worker thread at startup.
pub(crate) fn mark_worker_thread() {
    ON_WORKER_THREAD.with(|w| w.set(true));
}

pub(crate) fn on_worker_thread() -> bool {
    ON_WORKER_THREAD.with(Cell::get)
}

pub(crate) struct FlushCoordinator {
    state: Mutex<FlushState>,
    flush_complete: Condvar,
}

struct FlushState {
    generation: u64,
    active_workers: usize,
    barriers: BTreeMap<u64, Barrier>,
    /// Set once shutdown has joined all workers.
    workers_gone: bool,
    /// The worker pool is being resized; new flushes wait.
    resizing: bool,
}

#[derive(Debug)]
struct Barrier {
    remaining: usize,
    /// Some sentinels were drained by shutdown instead of reaching a worker.
    discarded: bool,
}

impl FlushCoordinator {
    pub(crate) fn new(active_workers: usize) -> Self {
        FlushCoordinator {
            state: Mutex::new(FlushState {
                generation: 0,
                active_workers,
                barriers: BTreeMap::new(),
                workers_gone: false,
                resizing: false,
            }),
            flush_complete: Condvar::new(),
        }
    }

    /// Block until every op enqueued before this call has completed.
    pub(crate) fn flush(&self, queue: &WorkQueue) -> Result<(), Error> {
        if on_worker_thread() {
            return Err(Error::FlushFromCallback);
        }
        let state = self.state.lock().unwrap();
        let mut state = self
            .flush_complete
            .wait_while(state, |state| state.resizing)
            .unwrap();
        let outstanding = queue.flush_count();
        if outstanding == 0 && state.barriers.is_empty() {
            trace!("flush: nothing outstanding");
            return Ok(());
        }

        state.generation += 1;
        let generation = state.generation;
        let workers = state.active_workers;
        queue.enqueue_batch((0..workers).map(|_| WorkItem::Flush { generation }))?;
        state.barriers.insert(
            generation,
            Barrier {
                remaining: workers,
                discarded: false,
            },
        );
        debug!(generation, workers, outstanding, "flush start");

        let mut state = self
            .flush_complete
            .wait_while(state, |state| {
                let barrier = &state.barriers[&generation];
                barrier.remaining > 0 || (barrier.discarded && !state.workers_gone)
            })
            .unwrap();
        let barrier = state
            .barriers
            .remove(&generation)
            .expect("only the flusher removes its barrier");
        debug!(generation, discarded = barrier.discarded, "flush end");
        if barrier.discarded {
            Err(Error::SubsystemNotRunning)
        } else {
            Ok(())
        }
    }

    /// A worker popped the sentinel of `generation`; park until all of them are popped.
    pub(crate) fn arrive(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        let barrier = state
            .barriers
            .get_mut(&generation)
            .expect("implementation error: sentinel without barrier");
        barrier.remaining -= 1;
        trace!(generation, remaining = barrier.remaining, "arrived at flush barrier");
        if barrier.remaining == 0 {
            self.flush_complete.notify_all();
            return;
        }
        let _state = self
            .flush_complete
            .wait_while(state, |state| {
                state
                    .barriers
                    .get(&generation)
                    .map_or(false, |b| b.remaining > 0)
            })
            .unwrap();
    }

    /// Shutdown drained a sentinel of `generation` from the queue.
    pub(crate) fn sentinel_drained(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        let barrier = state
            .barriers
            .get_mut(&generation)
            .expect("implementation error: sentinel without barrier");
        barrier.remaining -= 1;
        barrier.discarded = true;
        if barrier.remaining == 0 {
            self.flush_complete.notify_all();
        }
    }

    /// Release flushers whose barrier was discarded; called after all workers exited.
    pub(crate) fn workers_gone(&self) {
        let mut state = self.state.lock().unwrap();
        state.workers_gone = true;
        self.flush_complete.notify_all();
    }

    /// Run `f` once no sentinel is outstanding, then publish the worker count it returns.
    ///
    /// New flushes wait until `f` returns. The flush lock is not held while
    /// `f` runs, so `f` may join workers whose callbacks use this coordinator.
    pub(crate) fn resize<R>(&self, f: impl FnOnce() -> (usize, R)) -> R {
        {
            let state = self.state.lock().unwrap();
            let mut state = self
                .flush_complete
                .wait_while(state, |state| {
                    state.resizing
                        || state.barriers.values().any(|barrier| barrier.remaining > 0)
                })
                .unwrap();
            state.resizing = true;
        }
        let mut state = scopeguard::guard(None, |active_workers: Option<usize>| {
            let mut state = self.state.lock().unwrap();
            if let Some(active_workers) = active_workers {
                state.active_workers = active_workers;
            }
            state.resizing = false;
            self.flush_complete.notify_all();
        });
        let (active_workers, ret) = f();
        *state = Some(active_workers);
        ret
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.state.lock().unwrap().active_workers
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;
    use crate::system::{queue::Dequeued, slots::SlotRef};

    #[test]
    fn fast_path_when_idle() {
        let coord = FlushCoordinator::new(2);
        let queue = WorkQueue::new();
        coord.flush(&queue).unwrap();
        assert_eq!(queue.flush_count(), 0);
    }

    #[test]
    fn each_worker_takes_one_sentinel() {
        let coord = Arc::new(FlushCoordinator::new(3));
        let queue = Arc::new(WorkQueue::new());
        let done = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let (coord, queue, done) =
                    (Arc::clone(&coord), Arc::clone(&queue), Arc::clone(&done));
                std::thread::spawn(move || {
                    let retire = AtomicBool::new(false);
                    let mut sentinels = 0;
                    while let Dequeued::Item(item) = queue.wait_dequeue(&retire) {
                        match item {
                            WorkItem::Flush { generation } => {
                                sentinels += 1;
                                coord.arrive(generation);
                            }
                            WorkItem::Op(_) => {
                                std::thread::sleep(Duration::from_millis(2));
                                done.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        queue.complete();
                    }
                    sentinels
                })
            })
            .collect();

        for round in 1..=2 {
            for idx in 0..10 {
                queue
                    .enqueue(WorkItem::Op(SlotRef { idx, unique_id: 1 }))
                    .unwrap();
            }
            coord.flush(&queue).unwrap();
            assert_eq!(done.load(Ordering::SeqCst), round * 10);
        }

        queue.close();
        let per_worker: Vec<usize> = workers.into_iter().map(|jh| jh.join().unwrap()).collect();
        assert_eq!(per_worker, vec![2, 2, 2]);
    }

    #[test]
    fn called_from_worker_thread() {
        let coord = FlushCoordinator::new(1);
        let queue = WorkQueue::new();
        let res = std::thread::spawn(move || {
            mark_worker_thread();
            coord.flush(&queue)
        })
        .join()
        .unwrap();
        assert!(matches!(res, Err(Error::FlushFromCallback)));
        assert!(!on_worker_thread());
    }

    #[test]
    fn worker_count_readable_while_resizing() {
        let coord = FlushCoordinator::new(2);
        let during = coord.resize(|| (1, coord.active_workers()));
        assert_eq!(during, 2);
        assert_eq!(coord.active_workers(), 1);
    }
}
