//! Executing ops and dispatching their completions.

use std::{
    any::Any,
    collections::{hash_map::Entry, HashMap},
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
};

use tracing::{debug, error, warn};

use super::{
    lifecycle::Subsystem,
    slots::{Encoding, OpItems, SlotRef},
};
use crate::{
    engine::{Engine, EngineCursor, EngineError},
    ops::{callback::Callback, OpError, OpFlags, OpResult, OpState, OpType},
    CompletedOp, DataSource,
};

/// Engine cursors of one worker, one per bound data source.
#[derive(Default)]
pub(crate) struct CursorCache {
    cursors: HashMap<(u64, u64), (Arc<DataSource>, Box<dyn EngineCursor>)>,
}

impl CursorCache {
    fn get_or_open(
        &mut self,
        engine: &dyn Engine,
        source: &Arc<DataSource>,
    ) -> Result<&mut Box<dyn EngineCursor>, EngineError> {
        let key = source.cache_key();
        let entry = match self.cursors.entry(key) {
            Entry::Occupied(e) if e.get().0.uri() == source.uri() => e.into_mut(),
            Entry::Occupied(mut e) => {
                // hash collision: replace
                e.insert((Arc::clone(source), engine.open_cursor(source)?));
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert((Arc::clone(source), engine.open_cursor(source)?)),
        };
        Ok(&mut entry.1)
    }

    fn evict(&mut self, source: &DataSource) {
        self.cursors.remove(&source.cache_key());
    }

    pub(crate) fn len(&self) -> usize {
        self.cursors.len()
    }
}

/// Run the op in `slot_ref` on the calling worker, notify its callback and
/// return the slot to the pool.
pub(crate) fn execute(core: &Subsystem, cursors: &mut CursorCache, slot_ref: SlotRef) {
    core.pool
        .transition(slot_ref, OpState::Enqueued, OpState::Working);
    {
        let mut guard = core.pool.lock_slot(slot_ref.idx);
        let slot = &mut *guard;
        let (Some(source), Some(enc), Some(op_type)) =
            (slot.source.clone(), slot.encoding(), slot.op_type)
        else {
            unreachable!(
                "implementation error: enqueued op {} is incomplete",
                slot_ref.unique_id
            );
        };

        let items = &mut slot.items;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| {
            run_op(&*core.engine, cursors, &source, enc, op_type, items)
        })) {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!(id = slot_ref.unique_id, ?op_type, "engine panicked: {msg}");
                // the cursor may be in any state now
                cursors.evict(&source);
                Err(EngineError::Other(format!("engine panicked: {msg}")))
            }
        };
        if let Err(e) = &result {
            debug!(id = slot_ref.unique_id, ?op_type, error = %e, "op failed");
        }

        if let Some(callback) = slot.callback.take() {
            let op = CompletedOp {
                id: slot.unique_id,
                internal_id: slot.internal_id,
                op_type: Some(op_type),
                source: &source,
                enc,
                items: &slot.items,
            };
            notify(&*callback, &op, result.map_err(OpError::Engine));
        }
        slot.clear();
    }
    core.pool.reclaim(slot_ref);
    core.metrics.ops_completed.fetch_add(1, Ordering::Relaxed);
}

/// Free a slot that will never run, then tell its callback.
///
/// `from` is `Enqueued` for ops drained from the queue and `Ready` for ops
/// that were never submitted.
pub(crate) fn cancel(core: &Subsystem, slot_ref: SlotRef, from: OpState) {
    // an unsubmitted op belongs to whoever moves it out of Ready first
    if from == OpState::Ready && !core.pool.release_unsubmitted(slot_ref) {
        return;
    }
    let (callback, source, items, op_type, flags, internal_id) = {
        let mut slot = core.pool.lock_slot(slot_ref.idx);
        if slot.unique_id != slot_ref.unique_id {
            return;
        }
        let taken = (
            slot.callback.take(),
            slot.source.take(),
            std::mem::take(&mut slot.items),
            slot.op_type,
            slot.flags,
            slot.internal_id,
        );
        slot.clear();
        taken
    };
    match from {
        OpState::Enqueued => core.pool.transition(slot_ref, from, OpState::Free),
        OpState::Ready => {}
        OpState::Free | OpState::Working => {
            unreachable!("implementation error: cannot cancel a {from:?} op")
        }
    }

    // None if the handle was dropped concurrently
    let (Some(callback), Some(source)) = (callback, source) else {
        return;
    };
    let op = CompletedOp {
        id: slot_ref.unique_id,
        internal_id,
        op_type,
        source: &source,
        enc: Encoding {
            formats: source.formats(),
            flags,
        },
        items: &items,
    };
    notify(&*callback, &op, Err(OpError::Cancelled));
    core.metrics.ops_cancelled.fetch_add(1, Ordering::Relaxed);
}

fn run_op(
    engine: &dyn Engine,
    cursors: &mut CursorCache,
    source: &Arc<DataSource>,
    enc: Encoding,
    op_type: OpType,
    items: &mut OpItems,
) -> Result<(), EngineError> {
    let cursor = cursors.get_or_open(engine, source)?;
    let Some(key) = items.encoded_key(enc) else {
        unreachable!("implementation error: submitted op without key");
    };
    match op_type {
        OpType::Search => {
            let found = cursor.search(key)?;
            items.set_found_value(&found);
            Ok(())
        }
        OpType::Remove => cursor.remove(key),
        OpType::Insert | OpType::Put | OpType::Update => {
            let Some(value) = items.encoded_value() else {
                unreachable!("implementation error: submitted {op_type:?} without value");
            };
            match op_type {
                OpType::Insert => {
                    cursor.insert(key, value, enc.flags.contains(OpFlags::OVERWRITE))
                }
                OpType::Put => cursor.insert(key, value, true),
                _ => cursor.update(key, value),
            }
        }
        OpType::Flush => unreachable!("implementation error: flush is not a slot op"),
    }
}

fn notify(callback: &dyn Callback, op: &CompletedOp<'_>, result: OpResult) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback.notify(op, result))) {
        warn!(
            id = op.id(),
            "completion callback panicked: {}",
            panic_message(&*payload)
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
