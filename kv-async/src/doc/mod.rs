//! Longer-form writing about this crate.
//!
//! Table Of Contents:
//!
//! - [Design](`design`)

pub mod design {
    #![doc = include_str!("design.md")]
}
