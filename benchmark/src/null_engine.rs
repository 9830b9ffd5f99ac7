//! An engine without storage. Every write succeeds, every search finds an
//! empty value.

use bytes::Bytes;
use kv_async::{
    engine::{Engine, EngineCursor, EngineError},
    kv_common::Formats,
    DataSource,
};

pub(crate) struct NullEngine;

impl Engine for NullEngine {
    fn formats(&self, _uri: &str) -> Result<Formats, EngineError> {
        Ok(Formats::RAW)
    }

    fn open_cursor(&self, _source: &DataSource) -> Result<Box<dyn EngineCursor>, EngineError> {
        Ok(Box::new(NullCursor))
    }
}

struct NullCursor;

impl EngineCursor for NullCursor {
    fn search(&mut self, _key: &[u8]) -> Result<Bytes, EngineError> {
        Ok(Bytes::new())
    }

    fn insert(&mut self, _key: &[u8], _value: &[u8], _overwrite: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn update(&mut self, _key: &[u8], _value: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }

    fn remove(&mut self, _key: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }
}
