//! Types shared between [`kv-async`](../kv_async/index.html) and its users:
//! key/value buffers, the closed set of item formats, and the packed
//! record-number encoding.

pub mod dump;
pub mod format;
pub mod intpack;
pub mod item;

pub use format::{Formats, ItemFormat};
pub use intpack::PackedRecno;
pub use item::{Item, Location};

pub use bytes;
