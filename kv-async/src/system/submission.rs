//! Handing populated ops over to the workers.

pub mod op_handle;

use super::{lifecycle::Subsystem, queue::WorkItem, slots::SlotRef};
use crate::{ops::OpState, Error};

/// `Ready -> Enqueued`, then append to the work queue.
///
/// On error the op did not reach the queue. If shutdown closed the queue
/// between the two steps, the slot is already back to `Free`.
pub(crate) fn submit(core: &Subsystem, slot_ref: SlotRef) -> Result<(), Error> {
    core.pool.mark_enqueued(slot_ref)?;
    if let Err(e) = core.queue.enqueue(WorkItem::Op(slot_ref)) {
        core.pool.lock_slot(slot_ref.idx).clear();
        core.pool
            .transition(slot_ref, OpState::Enqueued, OpState::Free);
        return Err(e);
    }
    Ok(())
}
