//! Binding of an op to a data source: URI, op config, and the key/value
//! formats looked up from the engine.
//!
//! Format lookups go through the engine, so each subsystem keeps a
//! [`FormatCache`] keyed by the xxh3 hashes of the URI and config strings.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use kv_common::{dump::DumpMode, Formats};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::{engine::Engine, ops::OpFlags, Error};

/// A data source an op is bound to.
#[derive(Debug)]
pub struct DataSource {
    uri: String,
    config: String,
    uri_hash: u64,
    cfg_hash: u64,
    formats: Formats,
    options: OpConfig,
}

impl DataSource {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The op config string the data source was bound with.
    pub fn config(&self) -> &str {
        &self.config
    }

    pub fn formats(&self) -> Formats {
        self.formats
    }

    pub(crate) fn cache_key(&self) -> (u64, u64) {
        (self.uri_hash, self.cfg_hash)
    }

    pub(crate) fn flags(&self) -> OpFlags {
        self.options.flags()
    }

    fn matches(&self, uri: &str, config: &str) -> bool {
        self.uri == uri && self.config == config
    }
}

/// Parsed op config string, e.g. `"overwrite=false,dump=hex"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpConfig {
    pub(crate) overwrite: bool,
    pub(crate) raw: bool,
    pub(crate) dump: Option<DumpMode>,
}

impl Default for OpConfig {
    fn default() -> Self {
        OpConfig {
            overwrite: true,
            raw: false,
            dump: None,
        }
    }
}

impl OpConfig {
    pub(crate) fn parse(config: &str) -> Result<Self, Error> {
        let mut parsed = OpConfig::default();
        for entry in config.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = match entry.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (entry, None),
            };
            match key {
                "overwrite" => parsed.overwrite = parse_bool(key, value)?,
                "raw" => parsed.raw = parse_bool(key, value)?,
                "dump" => {
                    parsed.dump = match value {
                        Some("hex") => Some(DumpMode::Hex),
                        Some("print") => Some(DumpMode::Print),
                        other => {
                            return Err(Error::InvalidConfig(format!(
                                "dump must be hex or print, got {other:?}"
                            )))
                        }
                    }
                }
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown op config key {key:?}"
                    )))
                }
            }
        }
        Ok(parsed)
    }

    pub(crate) fn flags(&self) -> OpFlags {
        let mut flags = OpFlags::empty();
        flags.set(OpFlags::OVERWRITE, self.overwrite);
        flags.set(OpFlags::RAW, self.raw);
        match self.dump {
            Some(DumpMode::Hex) => flags |= OpFlags::DUMP_HEX,
            Some(DumpMode::Print) => flags |= OpFlags::DUMP_PRINT,
            None => (),
        }
        flags
    }
}

fn parse_bool(key: &str, value: Option<&str>) -> Result<bool, Error> {
    match value {
        None | Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(Error::InvalidConfig(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}

/// Per-subsystem cache of bound data sources.
#[derive(Default)]
pub(crate) struct FormatCache {
    entries: Mutex<HashMap<(u64, u64), Arc<DataSource>>>,
}

impl FormatCache {
    pub(crate) fn get_or_insert(
        &self,
        engine: &dyn Engine,
        uri: &str,
        config: &str,
    ) -> Result<Arc<DataSource>, Error> {
        let key = (xxh3_64(uri.as_bytes()), xxh3_64(config.as_bytes()));
        {
            let entries = self.entries.lock().unwrap();
            if let Some(source) = entries.get(&key) {
                if source.matches(uri, config) {
                    return Ok(Arc::clone(source));
                }
            }
        }

        // miss: ask the engine without holding the cache lock
        let options = OpConfig::parse(config)?;
        let formats = engine.formats(uri).map_err(|source| Error::DataSource {
            uri: uri.to_owned(),
            source,
        })?;
        debug!(uri, config, ?formats, "bind data source");
        let source = Arc::new(DataSource {
            uri: uri.to_owned(),
            config: config.to_owned(),
            uri_hash: key.0,
            cfg_hash: key.1,
            formats,
            options,
        });

        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(cached) if cached.matches(uri, config) => Ok(Arc::clone(cached)),
            // hash collision with a different source: serve this one uncached
            Some(_) => Ok(source),
            None => {
                entries.insert(key, Arc::clone(&source));
                Ok(source)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{mem::MemEngine, EngineError};
    use kv_common::ItemFormat;

    #[test]
    fn parse_op_config() {
        assert_eq!(OpConfig::parse("").unwrap(), OpConfig::default());
        assert!(OpConfig::default().overwrite);

        let c = OpConfig::parse("overwrite=false, raw, dump=print").unwrap();
        assert!(!c.overwrite);
        assert!(c.raw);
        assert_eq!(c.dump, Some(DumpMode::Print));
        assert_eq!(c.flags(), OpFlags::RAW | OpFlags::DUMP_PRINT);

        assert_eq!(
            OpConfig::parse("dump=hex,overwrite=1").unwrap().flags(),
            OpFlags::OVERWRITE | OpFlags::DUMP_HEX
        );

        for bad in ["overwrite=maybe", "dump=base64", "dump", "append=true"] {
            assert!(
                matches!(OpConfig::parse(bad), Err(Error::InvalidConfig(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn cache_hits_share_the_binding() {
        let engine = MemEngine::new();
        engine.create_table("table:a", "r", "S").unwrap();
        let cache = FormatCache::default();

        let first = cache.get_or_insert(&engine, "table:a", "").unwrap();
        let second = cache.get_or_insert(&engine, "table:a", "").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.formats().key, ItemFormat::RecordNumber);
        assert_eq!(first.formats().value, ItemFormat::Raw);

        let raw = cache.get_or_insert(&engine, "table:a", "raw").unwrap();
        assert!(!Arc::ptr_eq(&first, &raw));
        assert!(raw.flags().contains(OpFlags::RAW));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn unknown_source_is_not_cached() {
        let engine = MemEngine::new();
        let cache = FormatCache::default();
        let err = cache.get_or_insert(&engine, "table:nope", "").unwrap_err();
        assert!(matches!(
            err,
            Error::DataSource {
                source: EngineError::NoSuchSource(_),
                ..
            }
        ));
        assert_eq!(cache.len(), 0);
    }
}
