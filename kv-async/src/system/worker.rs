//! Worker threads.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use tracing::{debug, error, info, info_span};

use super::{
    completion::{self, CursorCache},
    flush,
    lifecycle::{StartTesting, Subsystem},
    queue::{Dequeued, WorkItem},
};
use crate::Error;

pub(crate) struct WorkerPool {
    next_id: usize,
    workers: Vec<WorkerThread>,
}

struct WorkerThread {
    id: usize,
    retire: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        WorkerPool {
            next_id: 0,
            workers: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn spawn(
        &mut self,
        core: &Arc<Subsystem>,
        testing: Option<&StartTesting>,
    ) -> Result<(), Error> {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(StartTesting {
            fail_spawn_of_worker: Some(fail_id),
        }) = testing
        {
            if *fail_id == id {
                return Err(Error::WorkerSpawn {
                    id,
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected spawn failure",
                    ),
                });
            }
        }

        let retire = Arc::new(AtomicBool::new(false));
        let join = std::thread::Builder::new()
            .name(format!("kv-async-{}-worker-{}", core.id, id))
            .spawn({
                let core = Arc::clone(core);
                let retire = Arc::clone(&retire);
                move || worker_main(core, id, retire)
            })
            .map_err(|source| Error::WorkerSpawn { id, source })?;
        core.metrics.workers_spawned.fetch_add(1, Ordering::Relaxed);
        self.workers.push(WorkerThread { id, retire, join });
        Ok(())
    }

    /// Stop the `count` most recently spawned workers and wait for them.
    pub(crate) fn retire(&mut self, count: usize, core: &Subsystem) {
        let keep = self.workers.len().saturating_sub(count);
        let retiring = self.workers.split_off(keep);
        for worker in &retiring {
            worker.retire.store(true, Ordering::Release);
        }
        core.queue.wake_all();
        Self::join(retiring);
    }

    /// Wait for every worker to exit. The queue must be closed.
    pub(crate) fn join_all(&mut self) {
        Self::join(std::mem::take(&mut self.workers));
    }

    fn join(workers: Vec<WorkerThread>) {
        for WorkerThread { id, join, .. } in workers {
            if join.join().is_err() {
                error!(worker = id, "worker thread panicked");
            }
        }
    }
}

fn worker_main(core: Arc<Subsystem>, id: usize, retire: Arc<AtomicBool>) {
    let span = info_span!("worker", system = core.id, worker = id);
    let _entered = span.enter();
    flush::mark_worker_thread();

    info!("worker start");
    scopeguard::defer_on_success! {info!("worker exit")};
    scopeguard::defer_on_unwind! {error!("worker panic")};

    let mut cursors = CursorCache::default();
    loop {
        match core.queue.wait_dequeue(&retire) {
            Dequeued::Item(WorkItem::Op(slot_ref)) => {
                completion::execute(&core, &mut cursors, slot_ref);
            }
            Dequeued::Item(WorkItem::Flush { generation }) => {
                core.flush.arrive(generation);
            }
            Dequeued::Retire => {
                debug!("retired");
                break;
            }
            Dequeued::Closed => break,
        }
        core.queue.complete();
    }
    debug!(open_cursors = cursors.len(), "dropping cursors");
    drop(cursors);
    core.metrics.workers_exited.fetch_add(1, Ordering::Relaxed);
}
