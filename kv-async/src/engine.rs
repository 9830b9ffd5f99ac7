//! The storage engine as seen by the async workers.
//!
//! Workers never touch table internals; everything goes through an
//! [`EngineCursor`] opened once per worker and data source.

use bytes::Bytes;
use kv_common::Formats;

use crate::DataSource;

pub mod mem;

pub trait Engine: Send + Sync + 'static {
    /// Key and value formats of the data source at `uri`.
    fn formats(&self, uri: &str) -> Result<Formats, EngineError>;

    fn open_cursor(&self, source: &DataSource) -> Result<Box<dyn EngineCursor>, EngineError>;
}

/// A positioned handle on one data source, owned by a single worker thread.
///
/// Keys and values arrive in their encoded form: record-number keys are
/// packed (see [`kv_common::intpack`]), everything else is passed through.
pub trait EngineCursor: Send {
    fn search(&mut self, key: &[u8]) -> Result<Bytes, EngineError>;
    /// Fails with [`EngineError::DuplicateKey`] if `overwrite` is false and the key exists.
    fn insert(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<(), EngineError>;
    /// Fails with [`EngineError::NotFound`] if the key does not exist.
    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;
    fn remove(&mut self, key: &[u8]) -> Result<(), EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("key not found")]
    NotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("no such data source: {0}")]
    NoSuchSource(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}
