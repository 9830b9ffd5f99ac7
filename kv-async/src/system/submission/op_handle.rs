//! The caller's side of an operation.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::{
    error::{ItemKind, ValidationError},
    ops::{OpState, OpType},
    system::{
        lifecycle::Subsystem,
        slots::{Encoding, OpItems, OpSlot, SlotRef},
    },
    DataSource, Error,
};

/// An allocated operation, ready to be populated and submitted.
///
/// Setters never fail on the spot: a bad key or value is remembered and
/// reported when the op is submitted. Submitting consumes the handle; the
/// outcome arrives at the op's [`Callback`](crate::Callback).
///
/// Dropping a handle that was never submitted returns its slot to the pool
/// without invoking the callback.
pub struct OpHandle {
    core: Arc<Subsystem>,
    // None once the slot has been handed over to the queue
    slot_ref: Option<SlotRef>,
}

/// A submission that was refused.
///
/// For validation failures the handle comes back so the caller can fix the
/// op and submit again.
///
/// A refused op never reaches its callback, with one exception: if shutdown
/// cancelled the op before the submission got to it, the callback has
/// already received [`OpError::Cancelled`](crate::OpError::Cancelled) and
/// the submission fails with [`Error::SubsystemNotRunning`].
#[derive(Debug, thiserror::Error)]
#[error("operation rejected: {error}")]
pub struct Rejected {
    #[source]
    pub error: Error,
    pub handle: Option<OpHandle>,
}

impl OpHandle {
    pub(crate) fn new(core: Arc<Subsystem>, slot_ref: SlotRef) -> Self {
        OpHandle {
            core,
            slot_ref: Some(slot_ref),
        }
    }

    fn slot_ref(&self) -> SlotRef {
        self.slot_ref
            .expect("slot_ref is only taken when consuming self")
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut OpSlot) -> R) -> R {
        let slot_ref = self.slot_ref();
        let mut slot = self.core.pool.lock_slot(slot_ref.idx);
        debug_assert_eq!(slot.unique_id, slot_ref.unique_id);
        f(&mut slot)
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&OpItems, Encoding) -> Result<R, ValidationError>,
    ) -> Result<R, ValidationError> {
        self.with_slot(|slot| match slot.encoding() {
            Some(enc) => f(&slot.items, enc),
            None => Err(ValidationError::Unbound),
        })
    }

    /// Unique across the lifetime of the subsystem.
    pub fn id(&self) -> u64 {
        self.slot_ref().unique_id
    }

    /// Position in the op pool; reused once the op completes.
    pub fn internal_id(&self) -> u32 {
        self.slot_ref().idx
    }

    /// `Ready` until submitted, or `Free` if shutdown cancelled the op.
    pub fn state(&self) -> OpState {
        self.core
            .pool
            .state_of(self.slot_ref())
            .unwrap_or(OpState::Free)
    }

    /// `None` until the first submission attempt.
    pub fn op_type(&self) -> Option<OpType> {
        self.with_slot(|slot| slot.op_type)
    }

    pub fn data_source(&self) -> Option<Arc<DataSource>> {
        self.with_slot(|slot| slot.source.clone())
    }

    /// The first setter failure since the last successful setter.
    pub fn saved_error(&self) -> Option<ValidationError> {
        self.with_slot(|slot| slot.saved_error.clone())
    }

    pub fn set_key(&mut self, key: impl Into<Bytes>) {
        let key = key.into();
        self.with_slot(|slot| slot.apply(ItemKind::Key, |items, enc| items.set_key(enc, key)));
    }

    pub fn set_key_recno(&mut self, recno: u64) {
        self.with_slot(|slot| {
            slot.apply(ItemKind::Key, |items, enc| items.set_key_recno(enc, recno))
        });
    }

    /// Set the key from its `dump=hex` or `dump=print` text form.
    pub fn set_key_dump(&mut self, text: &str) {
        self.with_slot(|slot| {
            slot.apply(ItemKind::Key, |items, enc| items.set_key_dump(enc, text))
        });
    }

    pub fn set_value(&mut self, value: impl Into<Bytes>) {
        let value = value.into();
        self.with_slot(|slot| {
            slot.apply(ItemKind::Value, |items, enc| items.set_value(enc, value))
        });
    }

    pub fn set_value_recno(&mut self, recno: u64) {
        self.with_slot(|slot| {
            slot.apply(ItemKind::Value, |items, enc| {
                items.set_value_recno(enc, recno)
            })
        });
    }

    pub fn set_value_dump(&mut self, text: &str) {
        self.with_slot(|slot| {
            slot.apply(ItemKind::Value, |items, enc| {
                items.set_value_dump(enc, text)
            })
        });
    }

    pub fn get_key(&self) -> Result<Bytes, ValidationError> {
        self.read(|items, enc| items.get_key(enc))
    }

    pub fn get_key_recno(&self) -> Result<u64, ValidationError> {
        self.read(|items, enc| items.get_key_recno(enc))
    }

    pub fn key_dump(&self) -> Result<String, ValidationError> {
        self.read(|items, enc| items.key_dump(enc))
    }

    pub fn get_value(&self) -> Result<Bytes, ValidationError> {
        self.read(|items, enc| items.get_value(enc))
    }

    pub fn get_value_recno(&self) -> Result<u64, ValidationError> {
        self.read(|items, enc| items.get_value_recno(enc))
    }

    pub fn value_dump(&self) -> Result<String, ValidationError> {
        self.read(|items, enc| items.value_dump(enc))
    }

    pub fn search(self) -> Result<(), Rejected> {
        self.submit(OpType::Search)
    }

    pub fn insert(self) -> Result<(), Rejected> {
        self.submit(OpType::Insert)
    }

    pub fn put(self) -> Result<(), Rejected> {
        self.submit(OpType::Put)
    }

    pub fn update(self) -> Result<(), Rejected> {
        self.submit(OpType::Update)
    }

    pub fn remove(self) -> Result<(), Rejected> {
        self.submit(OpType::Remove)
    }

    fn submit(mut self, op_type: OpType) -> Result<(), Rejected> {
        if self.state() != OpState::Ready {
            // cancelled by shutdown
            return Err(Rejected {
                error: Error::SubsystemNotRunning,
                handle: None,
            });
        }
        let validated = self.with_slot(|slot| -> Option<Result<(), ValidationError>> {
            // cleared by shutdown since the check above
            slot.source.as_ref()?;
            slot.op_type = Some(op_type);
            Some(slot.validate_for(op_type))
        });
        match validated {
            None => {
                return Err(Rejected {
                    error: Error::SubsystemNotRunning,
                    handle: None,
                })
            }
            Some(Err(e)) => {
                return Err(Rejected {
                    error: Error::Validation(e),
                    handle: Some(self),
                })
            }
            Some(Ok(())) => {}
        }
        let slot_ref = self.slot_ref();
        match super::submit(&self.core, slot_ref) {
            Ok(()) => {
                trace!(id = slot_ref.unique_id, ?op_type, "submitted");
                self.slot_ref = None;
                Ok(())
            }
            // Drop releases or finishes releasing the slot
            Err(error) => Err(Rejected {
                error,
                handle: None,
            }),
        }
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        let Some(slot_ref) = self.slot_ref.take() else {
            return;
        };
        {
            let mut slot = self.core.pool.lock_slot(slot_ref.idx);
            if slot.unique_id == slot_ref.unique_id {
                slot.clear();
            }
        }
        if self.core.pool.release_unsubmitted(slot_ref) {
            trace!(id = slot_ref.unique_id, "unsubmitted op released");
        }
    }
}

impl std::fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpHandle")
            .field("slot", &self.slot_ref)
            .finish()
    }
}

/// Read-only view of an op handed to its callback.
pub struct CompletedOp<'a> {
    pub(crate) id: u64,
    pub(crate) internal_id: u32,
    pub(crate) op_type: Option<OpType>,
    pub(crate) source: &'a DataSource,
    pub(crate) enc: Encoding,
    pub(crate) items: &'a OpItems,
}

impl<'a> CompletedOp<'a> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn internal_id(&self) -> u32 {
        self.internal_id
    }

    /// `None` for an op cancelled by shutdown before it was submitted.
    pub fn op_type(&self) -> Option<OpType> {
        self.op_type
    }

    pub fn data_source(&self) -> &'a DataSource {
        self.source
    }

    pub fn get_key(&self) -> Result<Bytes, ValidationError> {
        self.items.get_key(self.enc)
    }

    pub fn get_key_recno(&self) -> Result<u64, ValidationError> {
        self.items.get_key_recno(self.enc)
    }

    pub fn key_dump(&self) -> Result<String, ValidationError> {
        self.items.key_dump(self.enc)
    }

    /// For a successful search, the value found.
    pub fn get_value(&self) -> Result<Bytes, ValidationError> {
        self.items.get_value(self.enc)
    }

    pub fn get_value_recno(&self) -> Result<u64, ValidationError> {
        self.items.get_value_recno(self.enc)
    }

    pub fn value_dump(&self) -> Result<String, ValidationError> {
        self.items.value_dump(self.enc)
    }

    pub(crate) fn encoded_key(&self) -> Option<&'a [u8]> {
        self.items.encoded_key(self.enc)
    }

    pub(crate) fn encoded_value(&self) -> Option<&'a [u8]> {
        self.items.encoded_value()
    }
}
