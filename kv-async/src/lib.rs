//! An asynchronous operation subsystem for an embedded key/value engine.
//!
//! Callers on any thread allocate an op from a fixed pool, fill in a key and
//! value, and submit it. A small pool of worker threads executes submitted
//! ops against the [`Engine`](engine::Engine) in FIFO order and reports each
//! outcome to the op's [`Callback`]. [`SubsystemHandle::flush`] waits until
//! everything submitted before it has completed.
//!
//! # Usage
//!
//! 1. [`Subsystem::start`] a subsystem on top of an engine to get a [`SubsystemHandle`].
//! 2. [`allocate`](SubsystemHandle::allocate) an [`OpHandle`] for a data source, passing a callback.
//! 3. Set the key (and value) on the handle.
//! 4. Submit it with one of [`search`](OpHandle::search), [`insert`](OpHandle::insert),
//!    [`put`](OpHandle::put), [`update`](OpHandle::update) or [`remove`](OpHandle::remove).
//!    This consumes the handle; the slot now belongs to the subsystem.
//! 5. The callback runs on a worker thread once the op has executed.
//!
//! Allocation never blocks. When all slots are in use it fails with
//! [`Error::AllocationExhausted`]; flush or wait for some callbacks, then retry.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kv_async::{callback, engine::mem::MemEngine, AsyncConfig, Subsystem};
//!
//! let engine = MemEngine::new();
//! engine.create_table("table:example", "S", "S").unwrap();
//! let system = Subsystem::start(Arc::new(engine.clone()), AsyncConfig::default()).unwrap();
//!
//! let (cb, mut completions) = callback::channel();
//! let mut op = system.allocate("table:example", "", Arc::clone(&cb)).unwrap();
//! op.set_key("hello");
//! op.set_value("world");
//! op.put().unwrap();
//!
//! system.flush().unwrap();
//! let done = completions.blocking_recv().unwrap();
//! assert!(done.result.is_ok());
//! assert_eq!(engine.get("table:example", b"hello").as_deref(), Some(&b"world"[..]));
//!
//! system.shutdown();
//! ```
//!
//! # Design
//!
//! See [`crate::doc`].

pub mod doc;

pub mod engine;
mod error;
pub mod metrics;
pub mod ops;

mod system;

pub use error::{Error, ItemKind, ValidationError};
pub use ops::callback::{self, Callback, Completion, CompletionReceiver};
pub use ops::{OpError, OpFlags, OpResult, OpState, OpType};
pub use system::data_source::DataSource;
pub use system::lifecycle::handle::SubsystemHandle;
pub use system::lifecycle::{
    AsyncConfig, LifecycleState, Subsystem, DEFAULT_POOL_SIZE, MAX_WORKERS,
};
pub use system::submission::op_handle::{CompletedOp, OpHandle, Rejected};

pub use kv_common;

#[doc(hidden)]
pub mod env_tunables {
    pub(crate) static DEFAULT_WORKER_COUNT: once_cell::sync::Lazy<usize> =
        once_cell::sync::Lazy::new(|| match std::env::var("KV_ASYNC_DEFAULT_WORKER_COUNT") {
            Ok(v) => v
                .parse()
                .unwrap_or_else(|e| panic!("KV_ASYNC_DEFAULT_WORKER_COUNT={v:?}: {e}")),
            Err(std::env::VarError::NotPresent) => 2,
            Err(std::env::VarError::NotUnicode(_)) => {
                panic!("KV_ASYNC_DEFAULT_WORKER_COUNT must be a unicode string")
            }
        });
    pub(crate) static DUMP_POOL_ON_EXHAUSTION: once_cell::sync::Lazy<bool> =
        once_cell::sync::Lazy::new(|| {
            std::env::var("KV_ASYNC_DUMP_POOL_ON_EXHAUSTION")
                .map(|v| v == "1")
                .unwrap_or_else(|e| match e {
                    std::env::VarError::NotPresent => false, // default-off
                    std::env::VarError::NotUnicode(_) => {
                        panic!("KV_ASYNC_DUMP_POOL_ON_EXHAUSTION must be a unicode string")
                    }
                })
        });
    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("KV_ASYNC_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "KV_ASYNC_DEFAULT_WORKER_COUNT" | "KV_ASYNC_DUMP_POOL_ON_EXHAUSTION" => {}
                x => panic!("env var starts with KV_ASYNC_ but is not an env_tunable: {x:?}"),
            });
    }
}
