//! Operation vocabulary: what an op does, where it is in its lifecycle, and
//! how it finished.

pub mod callback;

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// Internal barrier entry, never visible to a callback.
    Flush,
    /// Insert the key; with `overwrite=false` fails if the key already exists.
    Insert,
    /// Set the value for the key unconditionally.
    Put,
    Remove,
    /// Look the key up and return its value.
    Search,
    /// Set the value of an existing key.
    Update,
}

impl OpType {
    /// Whether the op carries a value to the engine.
    pub fn needs_value(self) -> bool {
        matches!(self, OpType::Insert | OpType::Put | OpType::Update)
    }
}

/// Lifecycle state of a slot in the op pool.
///
/// ```text
///   Free ──allocate──▶ Ready ──submit──▶ Enqueued ──dequeue──▶ Working
///    ▲                  │                  │                     │
///    └──drop / cancel───┴──────cancel──────┘◀──────reclaim───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    Free,
    Ready,
    Enqueued,
    Working,
}

impl OpState {
    pub(crate) fn can_transition_to(self, next: OpState) -> bool {
        use OpState::*;
        matches!(
            (self, next),
            (Free, Ready)
                | (Ready, Enqueued)
                | (Enqueued, Working)
                | (Working, Free)
                // unsubmitted handle dropped, or cancelled at shutdown
                | (Ready, Free)
                // enqueue rejected, or drained from the queue at shutdown
                | (Enqueued, Free)
        )
    }

    pub(crate) fn discriminant_str(self) -> &'static str {
        match self {
            OpState::Free => "Free",
            OpState::Ready => "Ready",
            OpState::Enqueued => "Enqueued",
            OpState::Working => "Working",
        }
    }
}

bitflags::bitflags! {
    /// Per-op options, derived from the data source's config string at bind time.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct OpFlags: u32 {
        /// The op is bound to a data source.
        const DATA_SOURCE = 1 << 0;
        const DUMP_HEX = 1 << 1;
        const DUMP_PRINT = 1 << 2;
        /// Insert replaces an existing value instead of failing.
        const OVERWRITE = 1 << 3;
        /// Record-number items are accessed in their packed form.
        const RAW = 1 << 4;
    }
}

impl OpFlags {
    pub(crate) fn dump_mode(self) -> Option<kv_common::dump::DumpMode> {
        if self.contains(OpFlags::DUMP_HEX) {
            Some(kv_common::dump::DumpMode::Hex)
        } else if self.contains(OpFlags::DUMP_PRINT) {
            Some(kv_common::dump::DumpMode::Print)
        } else {
            None
        }
    }
}

/// Outcome of an executed op, as delivered to its callback.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The subsystem shut down before the op ran.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

pub type OpResult = Result<(), OpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        use OpState::*;
        let all = [Free, Ready, Enqueued, Working];
        let legal = [
            (Free, Ready),
            (Ready, Enqueued),
            (Enqueued, Working),
            (Working, Free),
            (Ready, Free),
            (Enqueued, Free),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn dump_mode_from_flags() {
        assert_eq!(OpFlags::empty().dump_mode(), None);
        assert_eq!(
            (OpFlags::DATA_SOURCE | OpFlags::DUMP_HEX).dump_mode(),
            Some(kv_common::dump::DumpMode::Hex)
        );
        assert_eq!(
            OpFlags::DUMP_PRINT.dump_mode(),
            Some(kv_common::dump::DumpMode::Print)
        );
    }
}
