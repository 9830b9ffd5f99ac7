//! FIFO of work for the worker threads.
//!
//! The queue lock is only ever held for a push or a pop; nobody calls into
//! the engine or a callback with it held.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
};

use super::slots::SlotRef;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Op(SlotRef),
    /// Barrier sentinel, one per worker per flush.
    Flush { generation: u64 },
}

pub(crate) enum Dequeued {
    Item(WorkItem),
    /// The calling worker was asked to exit.
    Retire,
    Closed,
}

pub(crate) struct WorkQueue {
    inner: Mutex<QueueInner>,
    work_available: Condvar,
}

struct QueueInner {
    items: VecDeque<WorkItem>,
    /// Popped but not yet [`WorkQueue::complete`]d.
    in_progress: usize,
    closed: bool,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        WorkQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                in_progress: 0,
                closed: false,
            }),
            work_available: Condvar::new(),
        }
    }

    pub(crate) fn enqueue(&self, item: WorkItem) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::SubsystemNotRunning);
        }
        inner.items.push_back(item);
        drop(inner);
        self.work_available.notify_one();
        Ok(())
    }

    /// Append all `items` in one critical section.
    pub(crate) fn enqueue_batch<I>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::SubsystemNotRunning);
        }
        let before = inner.items.len();
        inner.items.extend(items);
        let added = inner.items.len() - before;
        drop(inner);
        for _ in 0..added {
            self.work_available.notify_one();
        }
        Ok(())
    }

    /// Non-blocking pop. Workers use [`Self::wait_dequeue`].
    #[cfg(test)]
    pub(crate) fn try_dequeue(&self) -> Option<WorkItem> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.pop_front()?;
        inner.in_progress += 1;
        Some(item)
    }

    /// Block until there is work, `retire` is set, or the queue is closed.
    pub(crate) fn wait_dequeue(&self, retire: &AtomicBool) -> Dequeued {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if retire.load(Ordering::Acquire) {
                return Dequeued::Retire;
            }
            if let Some(item) = inner.items.pop_front() {
                inner.in_progress += 1;
                return Dequeued::Item(item);
            }
            if inner.closed {
                return Dequeued::Closed;
            }
            inner = self.work_available.wait(inner).unwrap();
        }
    }

    /// Mark a dequeued item as finished.
    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_progress = inner
            .in_progress
            .checked_sub(1)
            .expect("implementation error: complete() without a dequeued item");
    }

    /// Queued plus in-progress items.
    pub(crate) fn flush_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.items.len() + inner.in_progress
    }

    /// Refuse further work, wake every waiter, and hand back whatever was still queued.
    pub(crate) fn close(&self) -> Vec<WorkItem> {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let drained = inner.items.drain(..).collect();
        drop(inner);
        self.work_available.notify_all();
        drained
    }

    /// Wake every waiting worker so it re-checks its retire flag.
    pub(crate) fn wake_all(&self) {
        let _inner = self.inner.lock().unwrap();
        self.work_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn op(idx: u32) -> WorkItem {
        WorkItem::Op(SlotRef {
            idx,
            unique_id: u64::from(idx) + 1,
        })
    }

    #[test]
    fn fifo_and_flush_count() {
        let q = WorkQueue::new();
        q.enqueue(op(0)).unwrap();
        q.enqueue_batch([WorkItem::Flush { generation: 1 }, op(1)])
            .unwrap();
        assert_eq!(q.flush_count(), 3);

        assert_eq!(q.try_dequeue(), Some(op(0)));
        assert_eq!(q.flush_count(), 3);
        q.complete();
        assert_eq!(q.flush_count(), 2);
        assert_eq!(q.try_dequeue(), Some(WorkItem::Flush { generation: 1 }));
        assert_eq!(q.try_dequeue(), Some(op(1)));
        assert_eq!(q.try_dequeue(), None);
        q.complete();
        q.complete();
        assert_eq!(q.flush_count(), 0);
    }

    #[test]
    fn close_drains_and_refuses() {
        let q = WorkQueue::new();
        q.enqueue(op(0)).unwrap();
        q.enqueue(op(1)).unwrap();
        assert_eq!(q.close(), vec![op(0), op(1)]);
        assert!(matches!(q.enqueue(op(2)), Err(Error::SubsystemNotRunning)));
        assert!(matches!(
            q.enqueue_batch([op(3)]),
            Err(Error::SubsystemNotRunning)
        ));
        assert!(matches!(
            q.wait_dequeue(&AtomicBool::new(false)),
            Dequeued::Closed
        ));
    }

    #[test]
    fn waiter_wakes_on_enqueue_and_retire() {
        let q = Arc::new(WorkQueue::new());
        let retire = Arc::new(AtomicBool::new(false));
        let jh = std::thread::spawn({
            let q = Arc::clone(&q);
            let retire = Arc::clone(&retire);
            move || {
                let mut got = Vec::new();
                loop {
                    match q.wait_dequeue(&retire) {
                        Dequeued::Item(item) => {
                            got.push(item);
                            q.complete();
                        }
                        Dequeued::Retire => return got,
                        Dequeued::Closed => panic!("not closed"),
                    }
                }
            }
        });
        q.enqueue(op(7)).unwrap();
        while q.flush_count() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        retire.store(true, Ordering::Release);
        q.wake_all();
        assert_eq!(jh.join().unwrap(), vec![op(7)]);
    }
}
