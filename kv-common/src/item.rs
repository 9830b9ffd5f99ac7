//! Key/value buffers owned by an operation slot.

use bytes::{Bytes, BytesMut};

/// Where the bytes of a set [`Item`] live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// References memory handed over by the caller.
    External,
    /// Copied into the item's own scratch buffer, e.g. a value returned by the engine.
    Internal,
}

/// A key or value buffer.
///
/// The scratch buffer's capacity survives [`Item::clear`], so a slot that is
/// reused for many operations stops allocating once it has seen its largest
/// internal value.
#[derive(Default)]
pub struct Item {
    external: Bytes,
    scratch: BytesMut,
    location: Option<Location>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference caller memory. No copy is made.
    pub fn set_external(&mut self, data: Bytes) {
        self.scratch.clear();
        self.external = data;
        self.location = Some(Location::External);
    }

    /// Copy `data` into the item's scratch buffer.
    pub fn set_internal(&mut self, data: &[u8]) {
        self.external = Bytes::new();
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        self.location = Some(Location::Internal);
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn is_set(&self) -> bool {
        self.location.is_some()
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.location? {
            Location::External => Some(&self.external),
            Location::Internal => Some(&self.scratch),
        }
    }

    /// An owned copy of the item; cheap for external items.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self.location? {
            Location::External => Some(self.external.clone()),
            Location::Internal => Some(Bytes::copy_from_slice(&self.scratch)),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().map_or(0, <[u8]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the internal scratch buffer.
    pub fn scratch_capacity(&self) -> usize {
        self.scratch.capacity()
    }

    /// Unset the item and drop any reference to caller memory.
    pub fn clear(&mut self) {
        self.external = Bytes::new();
        self.scratch.clear();
        self.location = None;
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("location", &self.location)
            .field("len", &self.len())
            .finish()
    }
}
