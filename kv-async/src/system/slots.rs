//! The fixed-capacity pool of operation slots.
//!
//! [`OpPool`] serves the following purposes:
//!
//! - Bound the number of operations a subsystem has in flight. Allocation
//!   never blocks; a full pool is reported as
//!   [`Error::AllocationExhausted`].
//! - Own the state machine of every slot (see [`OpState`]). States live in a
//!   separate array behind the *allocation lock*, so allocation and state
//!   transitions never touch slot contents.
//! - Own the contents of every slot ([`OpSlot`]) behind a per-slot lock, so
//!   populating keys and values of different ops never contends.
//!
//! Lock order: allocation lock before a slot lock, and only for a `Free`
//! slot during [`OpPool::allocate`]. Everybody else drops the slot lock
//! before taking the allocation lock, unless the slot is `Working`.

use std::{
    collections::HashMap,
    sync::{atomic::Ordering, Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use kv_common::{intpack::PackedRecno, Formats, Item, ItemFormat};
use tracing::{debug, trace};

use crate::{
    error::{ItemKind, ValidationError},
    metrics::MetricsStorage,
    ops::{callback::Callback, OpFlags, OpState, OpType},
    DataSource, Error,
};

/// Index of a slot plus the id of the allocation it refers to.
///
/// The id makes stale references detectable: a slot that was freed and
/// handed out again carries a different `unique_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotRef {
    pub(crate) idx: u32,
    pub(crate) unique_id: u64,
}

pub(crate) struct OpPool {
    /// Id of the owning subsystem, for logging.
    id: usize,
    inner: Mutex<PoolInner>,
    slots: Box<[Mutex<OpSlot>]>,
    metrics: &'static MetricsStorage,
}

struct PoolInner {
    entries: Vec<SlotEntry>,
    alloc_cursor: usize,
    op_id_counter: u64,
    open: bool,
}

#[derive(Clone, Copy)]
struct SlotEntry {
    state: OpState,
    unique_id: u64,
}

impl OpPool {
    pub(crate) fn new(id: usize, capacity: usize, metrics: &'static MetricsStorage) -> Self {
        OpPool {
            id,
            inner: Mutex::new(PoolInner {
                entries: vec![
                    SlotEntry {
                        state: OpState::Free,
                        unique_id: 0,
                    };
                    capacity
                ],
                alloc_cursor: 0,
                op_id_counter: 0,
                open: true,
            }),
            slots: (0..capacity)
                .map(|idx| Mutex::new(OpSlot::new(idx as u32)))
                .collect(),
            metrics,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot and bind it to `source` and `callback`.
    pub(crate) fn allocate(
        &self,
        source: Arc<DataSource>,
        callback: Arc<dyn Callback>,
    ) -> Result<SlotRef, Error> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::SubsystemNotRunning);
        }
        let capacity = inner.entries.len();
        let start = inner.alloc_cursor;
        let found = (0..capacity)
            .map(|step| (start + step) % capacity)
            .find(|&idx| inner.entries[idx].state == OpState::Free);
        let Some(idx) = found else {
            drop(inner);
            self.metrics.alloc_exhausted.fetch_add(1, Ordering::Relaxed);
            if *crate::env_tunables::DUMP_POOL_ON_EXHAUSTION {
                self.debug_dump();
            }
            return Err(Error::AllocationExhausted { capacity });
        };

        inner.op_id_counter += 1;
        let unique_id = inner.op_id_counter;
        inner.entries[idx] = SlotEntry {
            state: OpState::Ready,
            unique_id,
        };
        inner.alloc_cursor = (idx + 1) % capacity;
        {
            // the slot was Free, so nobody else holds its lock
            let mut slot = self.slots[idx].lock().unwrap();
            slot.bind(unique_id, source, callback);
        }
        drop(inner);

        self.metrics.ops_allocated.fetch_add(1, Ordering::Relaxed);
        trace!(system = self.id, idx, unique_id, "allocated op slot");
        Ok(SlotRef {
            idx: idx as u32,
            unique_id,
        })
    }

    /// Assert-checked state transition.
    pub(crate) fn transition(&self, slot: SlotRef, from: OpState, to: OpState) {
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.entries[slot.idx as usize];
        assert_eq!(
            entry.unique_id, slot.unique_id,
            "implementation error: stale reference to slot {}",
            slot.idx
        );
        assert_eq!(
            entry.state, from,
            "implementation error: slot {} must be {:?} to become {:?}",
            slot.idx, from, to
        );
        assert!(
            from.can_transition_to(to),
            "implementation error: illegal transition {from:?} -> {to:?}"
        );
        entry.state = to;
    }

    /// `Ready -> Enqueued`, refused once allocation is closed.
    ///
    /// A refused op that is still `Ready` goes straight to `Free`, so shutdown
    /// does not cancel it as well.
    pub(crate) fn mark_enqueued(&self, slot: SlotRef) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let open = inner.open;
        let entry = &mut inner.entries[slot.idx as usize];
        let ready = entry.unique_id == slot.unique_id && entry.state == OpState::Ready;
        if !open {
            if ready {
                entry.state = OpState::Free;
            }
            return Err(Error::SubsystemNotRunning);
        }
        assert!(
            ready,
            "implementation error: submitting slot {} in state {:?}",
            slot.idx, entry.state
        );
        entry.state = OpState::Enqueued;
        Ok(())
    }

    /// `Working -> Free` after the worker cleared the slot.
    pub(crate) fn reclaim(&self, slot: SlotRef) {
        self.transition(slot, OpState::Working, OpState::Free);
    }

    /// `Ready -> Free` for an op that never got submitted.
    ///
    /// Returns false if someone else (shutdown or the handle) already did it.
    pub(crate) fn release_unsubmitted(&self, slot: SlotRef) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.entries[slot.idx as usize];
        if entry.unique_id == slot.unique_id && entry.state == OpState::Ready {
            entry.state = OpState::Free;
            true
        } else {
            false
        }
    }

    pub(crate) fn state_of(&self, slot: SlotRef) -> Option<OpState> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries[slot.idx as usize];
        (entry.unique_id == slot.unique_id).then_some(entry.state)
    }

    pub(crate) fn lock_slot(&self, idx: u32) -> MutexGuard<'_, OpSlot> {
        self.slots[idx as usize].lock().unwrap()
    }

    /// After this, [`Self::allocate`] and [`Self::mark_enqueued`] fail.
    pub(crate) fn close_for_allocation(&self) {
        self.inner.lock().unwrap().open = false;
    }

    /// Slots that were allocated but never submitted.
    pub(crate) fn ready_slots(&self) -> Vec<SlotRef> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == OpState::Ready)
            .map(|(idx, e)| SlotRef {
                idx: idx as u32,
                unique_id: e.unique_id,
            })
            .collect()
    }

    pub(crate) fn debug_dump(&self) -> HashMap<&'static str, usize> {
        let inner = self.inner.lock().unwrap();
        let mut by_state = HashMap::new();
        for entry in &inner.entries {
            by_state
                .entry(entry.state.discriminant_str())
                .and_modify(|v| *v += 1)
                .or_insert(1);
        }
        debug!(
            system = self.id,
            capacity = inner.entries.len(),
            alloc_cursor = inner.alloc_cursor,
            last_op_id = inner.op_id_counter,
            "op pool by state: {:?}",
            by_state
        );
        by_state
    }
}

/// Key/value encoding rules of a bound op.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Encoding {
    pub(crate) formats: Formats,
    pub(crate) flags: OpFlags,
}

impl Encoding {
    fn mismatch(&self, item: ItemKind, access: &'static str) -> ValidationError {
        let format = match item {
            ItemKind::Key => self.formats.key,
            ItemKind::Value => self.formats.value,
        };
        ValidationError::FormatMismatch {
            item,
            format,
            access,
        }
    }

    fn dump_mode(&self) -> Result<kv_common::dump::DumpMode, ValidationError> {
        self.flags
            .dump_mode()
            .ok_or(ValidationError::DumpNotConfigured)
    }
}

fn nonzero_recno(item: ItemKind, recno: PackedRecno) -> Result<PackedRecno, ValidationError> {
    if recno.recno() == 0 {
        return Err(ValidationError::InvalidRecno(item));
    }
    Ok(recno)
}

/// Key and value of an op.
///
/// Record-number keys live in their packed form in `key_recno`; every other
/// key, and every value, lives in an [`Item`].
#[derive(Default)]
pub(crate) struct OpItems {
    key: Item,
    key_recno: Option<PackedRecno>,
    value: Item,
}

impl OpItems {
    pub(crate) fn set_key(&mut self, enc: Encoding, key: Bytes) -> Result<(), ValidationError> {
        match enc.formats.key {
            ItemFormat::Raw => {
                self.key.set_external(key);
                Ok(())
            }
            ItemFormat::RecordNumber if enc.flags.contains(OpFlags::RAW) => {
                let recno = nonzero_recno(ItemKind::Key, PackedRecno::from_packed(&key)?)?;
                self.key_recno = Some(recno);
                Ok(())
            }
            ItemFormat::RecordNumber => Err(enc.mismatch(ItemKind::Key, "raw bytes")),
        }
    }

    pub(crate) fn set_key_recno(&mut self, enc: Encoding, recno: u64) -> Result<(), ValidationError> {
        match enc.formats.key {
            ItemFormat::RecordNumber => {
                self.key_recno = Some(nonzero_recno(ItemKind::Key, PackedRecno::new(recno))?);
                Ok(())
            }
            ItemFormat::Raw => Err(enc.mismatch(ItemKind::Key, "record number")),
        }
    }

    pub(crate) fn set_key_dump(&mut self, enc: Encoding, text: &str) -> Result<(), ValidationError> {
        let decoded = enc.dump_mode()?.decode(text)?;
        match enc.formats.key {
            ItemFormat::Raw => self.key.set_internal(&decoded),
            ItemFormat::RecordNumber => {
                let recno = nonzero_recno(ItemKind::Key, PackedRecno::from_packed(&decoded)?)?;
                self.key_recno = Some(recno);
            }
        }
        Ok(())
    }

    pub(crate) fn set_value(&mut self, enc: Encoding, value: Bytes) -> Result<(), ValidationError> {
        match enc.formats.value {
            ItemFormat::Raw => {}
            ItemFormat::RecordNumber if enc.flags.contains(OpFlags::RAW) => {
                nonzero_recno(ItemKind::Value, PackedRecno::from_packed(&value)?)?;
            }
            ItemFormat::RecordNumber => return Err(enc.mismatch(ItemKind::Value, "raw bytes")),
        }
        self.value.set_external(value);
        Ok(())
    }

    pub(crate) fn set_value_recno(
        &mut self,
        enc: Encoding,
        recno: u64,
    ) -> Result<(), ValidationError> {
        match enc.formats.value {
            ItemFormat::RecordNumber => {
                let packed = nonzero_recno(ItemKind::Value, PackedRecno::new(recno))?;
                self.value.set_internal(packed.as_bytes());
                Ok(())
            }
            ItemFormat::Raw => Err(enc.mismatch(ItemKind::Value, "record number")),
        }
    }

    pub(crate) fn set_value_dump(
        &mut self,
        enc: Encoding,
        text: &str,
    ) -> Result<(), ValidationError> {
        let decoded = enc.dump_mode()?.decode(text)?;
        if enc.formats.value == ItemFormat::RecordNumber {
            nonzero_recno(ItemKind::Value, PackedRecno::from_packed(&decoded)?)?;
        }
        self.value.set_internal(&decoded);
        Ok(())
    }

    /// The key as handed to the engine.
    pub(crate) fn encoded_key(&self, enc: Encoding) -> Option<&[u8]> {
        match enc.formats.key {
            ItemFormat::RecordNumber => self.key_recno.as_ref().map(PackedRecno::as_bytes),
            ItemFormat::Raw => self.key.as_bytes(),
        }
    }

    /// The value as handed to (or returned by) the engine.
    pub(crate) fn encoded_value(&self) -> Option<&[u8]> {
        self.value.as_bytes()
    }

    pub(crate) fn get_key(&self, enc: Encoding) -> Result<Bytes, ValidationError> {
        match enc.formats.key {
            ItemFormat::Raw => self.key.to_bytes().ok_or(ValidationError::KeyNotSet),
            ItemFormat::RecordNumber if enc.flags.contains(OpFlags::RAW) => self
                .key_recno
                .map(|r| Bytes::copy_from_slice(r.as_bytes()))
                .ok_or(ValidationError::KeyNotSet),
            ItemFormat::RecordNumber => Err(enc.mismatch(ItemKind::Key, "raw bytes")),
        }
    }

    pub(crate) fn get_key_recno(&self, enc: Encoding) -> Result<u64, ValidationError> {
        match enc.formats.key {
            ItemFormat::RecordNumber => self
                .key_recno
                .map(|r| r.recno())
                .ok_or(ValidationError::KeyNotSet),
            ItemFormat::Raw => Err(enc.mismatch(ItemKind::Key, "record number")),
        }
    }

    pub(crate) fn key_dump(&self, enc: Encoding) -> Result<String, ValidationError> {
        let mode = enc.dump_mode()?;
        let key = self.encoded_key(enc).ok_or(ValidationError::KeyNotSet)?;
        Ok(mode.encode(key))
    }

    pub(crate) fn get_value(&self, enc: Encoding) -> Result<Bytes, ValidationError> {
        match enc.formats.value {
            ItemFormat::RecordNumber if !enc.flags.contains(OpFlags::RAW) => {
                Err(enc.mismatch(ItemKind::Value, "raw bytes"))
            }
            _ => self.value.to_bytes().ok_or(ValidationError::ValueNotSet),
        }
    }

    pub(crate) fn get_value_recno(&self, enc: Encoding) -> Result<u64, ValidationError> {
        match enc.formats.value {
            ItemFormat::RecordNumber => {
                let packed = self.value.as_bytes().ok_or(ValidationError::ValueNotSet)?;
                Ok(PackedRecno::from_packed(packed)?.recno())
            }
            ItemFormat::Raw => Err(enc.mismatch(ItemKind::Value, "record number")),
        }
    }

    pub(crate) fn value_dump(&self, enc: Encoding) -> Result<String, ValidationError> {
        let mode = enc.dump_mode()?;
        let value = self.value.as_bytes().ok_or(ValidationError::ValueNotSet)?;
        Ok(mode.encode(value))
    }

    /// Store a value returned by the engine.
    pub(crate) fn set_found_value(&mut self, value: &[u8]) {
        self.value.set_internal(value);
    }

    fn clear_item(&mut self, item: ItemKind) {
        match item {
            ItemKind::Key => {
                self.key.clear();
                self.key_recno = None;
            }
            ItemKind::Value => self.value.clear(),
        }
    }

    fn clear(&mut self) {
        self.clear_item(ItemKind::Key);
        self.clear_item(ItemKind::Value);
    }
}

/// Contents of one pool entry. Reused across allocations.
pub(crate) struct OpSlot {
    pub(crate) internal_id: u32,
    /// Id of the most recent allocation; kept after the slot is cleared.
    pub(crate) unique_id: u64,
    pub(crate) source: Option<Arc<DataSource>>,
    pub(crate) items: OpItems,
    pub(crate) op_type: Option<OpType>,
    pub(crate) saved_error: Option<ValidationError>,
    pub(crate) callback: Option<Arc<dyn Callback>>,
    pub(crate) flags: OpFlags,
}

impl OpSlot {
    fn new(internal_id: u32) -> Self {
        OpSlot {
            internal_id,
            unique_id: 0,
            source: None,
            items: OpItems::default(),
            op_type: None,
            saved_error: None,
            callback: None,
            flags: OpFlags::empty(),
        }
    }

    fn bind(&mut self, unique_id: u64, source: Arc<DataSource>, callback: Arc<dyn Callback>) {
        assert!(
            self.source.is_none() && self.callback.is_none(),
            "implementation error: binding slot {} that was not cleared",
            self.internal_id
        );
        self.unique_id = unique_id;
        self.flags = OpFlags::DATA_SOURCE | source.flags();
        self.source = Some(source);
        self.callback = Some(callback);
        self.op_type = None;
        self.saved_error = None;
    }

    /// Encoding of the bound data source. `None` once the slot is cleared.
    pub(crate) fn encoding(&self) -> Option<Encoding> {
        let source = self.source.as_ref()?;
        Some(Encoding {
            formats: source.formats(),
            flags: self.flags,
        })
    }

    /// Run a setter and remember its outcome for submission.
    ///
    /// A failed setter unsets the item it was writing, a successful one
    /// forgets any earlier failure.
    pub(crate) fn apply<F>(&mut self, item: ItemKind, f: F)
    where
        F: FnOnce(&mut OpItems, Encoding) -> Result<(), ValidationError>,
    {
        let res = match self.encoding() {
            Some(enc) => f(&mut self.items, enc),
            None => Err(ValidationError::Unbound),
        };
        match res {
            Ok(()) => self.saved_error = None,
            Err(e) => {
                self.items.clear_item(item);
                self.saved_error = Some(e);
            }
        }
    }

    /// Check that the op can be handed to a worker as `op_type`.
    pub(crate) fn validate_for(&self, op_type: OpType) -> Result<(), ValidationError> {
        let enc = match self.encoding() {
            Some(enc) if self.flags.contains(OpFlags::DATA_SOURCE) => enc,
            _ => return Err(ValidationError::Unbound),
        };
        if let Some(e) = &self.saved_error {
            return Err(e.clone());
        }
        if self.items.encoded_key(enc).is_none() {
            return Err(ValidationError::KeyNotSet);
        }
        if op_type.needs_value() && self.items.encoded_value().is_none() {
            return Err(ValidationError::ValueNotSet);
        }
        Ok(())
    }

    /// Drop everything the previous op left behind except `unique_id`.
    ///
    /// Item buffers keep their capacity.
    pub(crate) fn clear(&mut self) {
        self.source = None;
        self.items.clear();
        self.op_type = None;
        self.saved_error = None;
        self.callback = None;
        self.flags = OpFlags::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::mem::MemEngine, ops::callback::from_fn, system::data_source::FormatCache,
    };

    fn leak_metrics() -> &'static MetricsStorage {
        Box::leak(Box::new(MetricsStorage::new_const()))
    }

    fn source(key_format: &str, value_format: &str, config: &str) -> Arc<DataSource> {
        let engine = MemEngine::new();
        engine
            .create_table("table:t", key_format, value_format)
            .unwrap();
        FormatCache::default()
            .get_or_insert(&engine, "table:t", config)
            .unwrap()
    }

    fn noop() -> Arc<dyn Callback> {
        from_fn(|_, _| {})
    }

    #[test]
    fn allocation_is_circular_and_bounded() {
        let metrics = leak_metrics();
        let pool = OpPool::new(0, 3, metrics);
        let src = source("S", "S", "");
        let a = pool.allocate(Arc::clone(&src), noop()).unwrap();
        let b = pool.allocate(Arc::clone(&src), noop()).unwrap();
        let c = pool.allocate(Arc::clone(&src), noop()).unwrap();
        assert_eq!((a.idx, b.idx, c.idx), (0, 1, 2));
        assert!(a.unique_id < b.unique_id && b.unique_id < c.unique_id);
        assert!(matches!(
            pool.allocate(Arc::clone(&src), noop()),
            Err(Error::AllocationExhausted { capacity: 3 })
        ));
        assert_eq!(metrics.alloc_exhausted.load(Ordering::Relaxed), 1);

        pool.lock_slot(b.idx).clear();
        assert!(pool.release_unsubmitted(b));
        assert!(!pool.release_unsubmitted(b));
        let d = pool.allocate(Arc::clone(&src), noop()).unwrap();
        assert_eq!(d.idx, 1);
        assert!(d.unique_id > c.unique_id);
        assert_eq!(pool.state_of(b), None);
        assert_eq!(pool.state_of(d), Some(OpState::Ready));
        assert_eq!(metrics.ops_allocated.load(Ordering::Relaxed), 4);

        let by_state = pool.debug_dump();
        assert_eq!(by_state.get("Ready"), Some(&3));
    }

    #[test]
    fn closed_pool_refuses_allocation_and_submission() {
        let pool = OpPool::new(0, 2, leak_metrics());
        let src = source("S", "S", "");
        let a = pool.allocate(Arc::clone(&src), noop()).unwrap();
        let b = pool.allocate(Arc::clone(&src), noop());
        assert!(b.is_ok());
        pool.close_for_allocation();
        assert!(matches!(
            pool.allocate(src, noop()),
            Err(Error::SubsystemNotRunning)
        ));
        assert_eq!(pool.ready_slots().len(), 2);
        // a refused submission takes its op out of the cancellation set
        assert!(matches!(
            pool.mark_enqueued(a),
            Err(Error::SubsystemNotRunning)
        ));
        assert_eq!(pool.state_of(a), Some(OpState::Free));
        assert_eq!(pool.ready_slots().len(), 1);
        assert!(!pool.release_unsubmitted(a));
    }

    #[test]
    fn full_state_cycle() {
        let pool = OpPool::new(0, 1, leak_metrics());
        let a = pool.allocate(source("S", "S", ""), noop()).unwrap();
        pool.mark_enqueued(a).unwrap();
        assert_eq!(pool.state_of(a), Some(OpState::Enqueued));
        pool.transition(a, OpState::Enqueued, OpState::Working);
        pool.lock_slot(a.idx).clear();
        pool.reclaim(a);
        assert_eq!(pool.state_of(a), Some(OpState::Free));
    }

    #[test]
    fn illegal_transition_panics() {
        let pool = OpPool::new(0, 1, leak_metrics());
        let a = pool.allocate(source("S", "S", ""), noop()).unwrap();
        assert_panic::assert_panic!(
            pool.transition(a, OpState::Ready, OpState::Working),
            String,
            contains "implementation error: illegal transition Ready -> Working",
        );
    }

    #[test]
    fn transition_from_wrong_state_panics() {
        let pool = OpPool::new(0, 1, leak_metrics());
        let a = pool.allocate(source("S", "S", ""), noop()).unwrap();
        assert_panic::assert_panic!(
            pool.reclaim(a),
            String,
            contains "implementation error: slot 0 must be Working to become Free",
        );
    }

    fn bound_slot(key_format: &str, value_format: &str, config: &str) -> OpSlot {
        let mut slot = OpSlot::new(0);
        slot.bind(1, source(key_format, value_format, config), noop());
        slot
    }

    #[test]
    fn record_number_items() {
        let mut slot = bound_slot("r", "r", "");
        slot.apply(ItemKind::Key, |items, enc| items.set_key_recno(enc, 300));
        slot.apply(ItemKind::Value, |items, enc| items.set_value_recno(enc, 7));
        assert_eq!(slot.saved_error, None);
        let enc = slot.encoding().unwrap();
        assert_eq!(slot.items.get_key_recno(enc), Ok(300));
        assert_eq!(slot.items.get_value_recno(enc), Ok(7));
        assert_eq!(
            slot.items.encoded_key(enc),
            Some(PackedRecno::new(300).as_bytes())
        );
        assert!(matches!(
            slot.items.get_key(enc),
            Err(ValidationError::FormatMismatch {
                item: ItemKind::Key,
                ..
            })
        ));
        slot.validate_for(OpType::Put).unwrap();

        slot.apply(ItemKind::Key, |items, enc| items.set_key_recno(enc, 0));
        assert_eq!(
            slot.saved_error,
            Some(ValidationError::InvalidRecno(ItemKind::Key))
        );
        assert_eq!(slot.items.encoded_key(enc), None);
        assert_eq!(
            slot.validate_for(OpType::Search),
            Err(ValidationError::InvalidRecno(ItemKind::Key))
        );
    }

    #[test]
    fn raw_record_number_access() {
        let mut slot = bound_slot("r", "S", "raw");
        let packed = Bytes::copy_from_slice(PackedRecno::new(42).as_bytes());
        slot.apply(ItemKind::Key, |items, enc| items.set_key(enc, packed.clone()));
        let enc = slot.encoding().unwrap();
        assert_eq!(slot.items.get_key(enc), Ok(packed));
        assert_eq!(slot.items.get_key_recno(enc), Ok(42));

        slot.apply(ItemKind::Key, |items, enc| {
            items.set_key(enc, Bytes::from_static(&[0xc0]))
        });
        assert!(matches!(slot.saved_error, Some(ValidationError::Pack(_))));
    }

    #[test]
    fn failed_setter_then_successful_setter() {
        let mut slot = bound_slot("S", "S", "");
        slot.apply(ItemKind::Key, |items, enc| items.set_key_recno(enc, 1));
        assert!(matches!(
            slot.saved_error,
            Some(ValidationError::FormatMismatch { .. })
        ));
        slot.apply(ItemKind::Key, |items, enc| {
            items.set_key(enc, Bytes::from_static(b"k"))
        });
        assert_eq!(slot.saved_error, None);
        assert_eq!(slot.validate_for(OpType::Search), Ok(()));
        assert_eq!(
            slot.validate_for(OpType::Insert),
            Err(ValidationError::ValueNotSet)
        );
    }

    #[test]
    fn dump_items() {
        let mut slot = bound_slot("S", "S", "dump=hex");
        slot.apply(ItemKind::Key, |items, enc| items.set_key_dump(enc, "6b6579"));
        slot.apply(ItemKind::Value, |items, enc| {
            items.set_value(enc, Bytes::from_static(b"\x00\xff"))
        });
        let enc = slot.encoding().unwrap();
        assert_eq!(slot.items.get_key(enc).unwrap(), Bytes::from_static(b"key"));
        assert_eq!(slot.items.key_dump(enc).unwrap(), "6b6579");
        assert_eq!(slot.items.value_dump(enc).unwrap(), "00ff");

        slot.apply(ItemKind::Key, |items, enc| items.set_key_dump(enc, "6b6"));
        assert!(matches!(slot.saved_error, Some(ValidationError::Dump(_))));

        let mut plain = bound_slot("S", "S", "");
        plain.apply(ItemKind::Key, |items, enc| items.set_key_dump(enc, "6b"));
        assert_eq!(plain.saved_error, Some(ValidationError::DumpNotConfigured));
    }

    #[test]
    fn clear_keeps_unique_id() {
        let mut slot = bound_slot("S", "S", "");
        slot.apply(ItemKind::Key, |items, enc| {
            items.set_key(enc, Bytes::from_static(b"k"))
        });
        slot.clear();
        assert_eq!(slot.unique_id, 1);
        assert!(slot.source.is_none());
        assert!(slot.callback.is_none());
        assert_eq!(slot.flags, OpFlags::empty());
        assert_eq!(slot.validate_for(OpType::Search), Err(ValidationError::Unbound));
    }
}
