//! Synchronous error types.
//!
//! Errors that surface when an operation *executes* are delivered through
//! the completion callback instead, see [`crate::OpError`].

use kv_common::{dump::DumpError, intpack::PackError, ItemFormat};

use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every slot of the pool is in use. Retry after some operations complete,
    /// for example after a [`flush`](crate::SubsystemHandle::flush).
    #[error("all {capacity} operation slots are in use")]
    AllocationExhausted { capacity: usize },
    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),
    #[error("async subsystem is not running")]
    SubsystemNotRunning,
    #[error("cannot bind data source {uri:?}: {source}")]
    DataSource {
        uri: String,
        #[source]
        source: EngineError,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn async worker {id}: {source}")]
    WorkerSpawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("flush must not be called from a completion callback")]
    FlushFromCallback,
    #[error("the worker pool cannot be resized from a completion callback")]
    ReconfigureFromCallback,
}

/// Which half of the key/value pair an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Key,
    Value,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Key => write!(f, "key"),
            ItemKind::Value => write!(f, "value"),
        }
    }
}

/// Problems with the contents of an operation, captured when a key or value
/// is set and reported when the operation is submitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{item} has format {format} and cannot be accessed as {access}")]
    FormatMismatch {
        item: ItemKind,
        format: ItemFormat,
        access: &'static str,
    },
    #[error("record number 0 is not a valid {0}")]
    InvalidRecno(ItemKind),
    #[error("malformed packed record number: {0}")]
    Pack(#[from] PackError),
    #[error("malformed dump text: {0}")]
    Dump(#[from] DumpError),
    #[error("data source was not opened with dump=hex or dump=print")]
    DumpNotConfigured,
    #[error("key not set")]
    KeyNotSet,
    #[error("value not set")]
    ValueNotSet,
    #[error("operation is not bound to a data source")]
    Unbound,
}
