//! In-memory [`Engine`] backed by one `BTreeMap` per table.
//!
//! Besides serving as the reference engine for examples and the benchmark, it
//! lets tests stall or fail cursor operations on purpose.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;
use kv_common::Formats;
use tracing::{debug, trace};

use super::{Engine, EngineCursor, EngineError};
use crate::DataSource;

#[derive(Clone, Default)]
pub struct MemEngine {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    gate: Gate,
    inject_io_errors: AtomicUsize,
    inject_panics: AtomicUsize,
    latency: Option<Duration>,
}

struct Table {
    formats: Formats,
    rows: Mutex<BTreeMap<Vec<u8>, Bytes>>,
}

#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    paused: bool,
    blocked: usize,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cursor operation sleeps for `latency` before touching the table.
    pub fn with_latency(latency: Duration) -> Self {
        MemEngine {
            shared: Arc::new(Shared {
                latency: Some(latency),
                ..Default::default()
            }),
        }
    }

    pub fn create_table(
        &self,
        uri: &str,
        key_format: &str,
        value_format: &str,
    ) -> Result<(), EngineError> {
        let formats = Formats::parse(key_format, value_format)
            .map_err(|e| EngineError::Other(format!("{uri}: {e}")))?;
        let mut tables = self.shared.tables.write().unwrap();
        if tables.contains_key(uri) {
            return Err(EngineError::Other(format!("table {uri} already exists")));
        }
        debug!(uri, ?formats, "create table");
        tables.insert(
            uri.to_owned(),
            Arc::new(Table {
                formats,
                rows: Mutex::new(BTreeMap::new()),
            }),
        );
        Ok(())
    }

    /// Read a row directly, bypassing the async machinery.
    pub fn get(&self, uri: &str, key: &[u8]) -> Option<Bytes> {
        let table = self.shared.table(uri).ok()?;
        let rows = table.rows.lock().unwrap();
        rows.get(key).cloned()
    }

    pub fn len(&self, uri: &str) -> usize {
        match self.shared.table(uri) {
            Ok(table) => table.rows.lock().unwrap().len(),
            Err(_) => 0,
        }
    }

    /// Make every subsequent cursor operation block until [`Self::resume`].
    pub fn pause(&self) {
        self.shared.gate.state.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.shared.gate.state.lock().unwrap();
        state.paused = false;
        self.shared.gate.cond.notify_all();
    }

    /// Number of cursor operations currently held at the pause gate.
    pub fn blocked(&self) -> usize {
        self.shared.gate.state.lock().unwrap().blocked
    }

    /// Wait until at least `n` cursor operations are held at the pause gate.
    pub fn wait_until_blocked(&self, n: usize) {
        let state = self.shared.gate.state.lock().unwrap();
        let _state = self
            .shared
            .gate
            .cond
            .wait_while(state, |state| state.blocked < n)
            .unwrap();
    }

    /// The next `count` cursor operations fail with an I/O error.
    pub fn inject_io_errors(&self, count: usize) {
        self.shared.inject_io_errors.store(count, Ordering::SeqCst);
    }

    /// The next `count` cursor operations panic.
    pub fn inject_panics(&self, count: usize) {
        self.shared.inject_panics.store(count, Ordering::SeqCst);
    }
}

impl Shared {
    fn table(&self, uri: &str) -> Result<Arc<Table>, EngineError> {
        let tables = self.tables.read().unwrap();
        tables
            .get(uri)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchSource(uri.to_owned()))
    }

    /// Common prologue of every cursor operation.
    fn enter(&self) -> Result<(), EngineError> {
        {
            let mut state = self.gate.state.lock().unwrap();
            if state.paused {
                state.blocked += 1;
                self.gate.cond.notify_all();
                state = self
                    .gate
                    .cond
                    .wait_while(state, |state| state.paused)
                    .unwrap();
                state.blocked -= 1;
            }
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        if take_one(&self.inject_panics) {
            panic!("injected engine panic");
        }
        if take_one(&self.inject_io_errors) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected I/O error",
            )));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Engine for MemEngine {
    fn formats(&self, uri: &str) -> Result<Formats, EngineError> {
        Ok(self.shared.table(uri)?.formats)
    }

    fn open_cursor(&self, source: &DataSource) -> Result<Box<dyn EngineCursor>, EngineError> {
        let table = self.shared.table(source.uri())?;
        trace!(uri = source.uri(), "open cursor");
        Ok(Box::new(MemCursor {
            shared: Arc::clone(&self.shared),
            table,
        }))
    }
}

struct MemCursor {
    shared: Arc<Shared>,
    table: Arc<Table>,
}

impl EngineCursor for MemCursor {
    fn search(&mut self, key: &[u8]) -> Result<Bytes, EngineError> {
        self.shared.enter()?;
        let rows = self.table.rows.lock().unwrap();
        rows.get(key).cloned().ok_or(EngineError::NotFound)
    }

    fn insert(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<(), EngineError> {
        self.shared.enter()?;
        let mut rows = self.table.rows.lock().unwrap();
        if !overwrite && rows.contains_key(key) {
            return Err(EngineError::DuplicateKey);
        }
        rows.insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.shared.enter()?;
        let mut rows = self.table.rows.lock().unwrap();
        match rows.get_mut(key) {
            Some(v) => {
                *v = Bytes::copy_from_slice(value);
                Ok(())
            }
            None => Err(EngineError::NotFound),
        }
    }

    fn remove(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.shared.enter()?;
        let mut rows = self.table.rows.lock().unwrap();
        rows.remove(key).map(|_| ()).ok_or(EngineError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(engine: &MemEngine, uri: &str) -> MemCursor {
        MemCursor {
            shared: Arc::clone(&engine.shared),
            table: engine.shared.table(uri).unwrap(),
        }
    }

    #[test]
    fn crud() {
        let engine = MemEngine::new();
        engine.create_table("table:t", "S", "S").unwrap();
        assert!(matches!(
            engine.create_table("table:t", "S", "S"),
            Err(EngineError::Other(_))
        ));
        assert!(matches!(
            engine.formats("table:nope"),
            Err(EngineError::NoSuchSource(_))
        ));

        let mut c = cursor(&engine, "table:t");
        c.insert(b"a", b"1", false).unwrap();
        assert!(matches!(
            c.insert(b"a", b"2", false),
            Err(EngineError::DuplicateKey)
        ));
        c.insert(b"a", b"2", true).unwrap();
        assert_eq!(&c.search(b"a").unwrap()[..], b"2");
        c.update(b"a", b"3").unwrap();
        assert!(matches!(c.update(b"b", b"3"), Err(EngineError::NotFound)));
        assert_eq!(engine.get("table:t", b"a").as_deref(), Some(&b"3"[..]));
        c.remove(b"a").unwrap();
        assert!(matches!(c.remove(b"a"), Err(EngineError::NotFound)));
        assert!(matches!(c.search(b"a"), Err(EngineError::NotFound)));
        assert_eq!(engine.len("table:t"), 0);
    }

    #[test]
    fn injected_io_errors_are_consumed() {
        let engine = MemEngine::new();
        engine.create_table("table:t", "S", "S").unwrap();
        let mut c = cursor(&engine, "table:t");
        engine.inject_io_errors(1);
        assert!(matches!(c.insert(b"a", b"1", true), Err(EngineError::Io(_))));
        c.insert(b"a", b"1", true).unwrap();
    }

    #[test]
    fn pause_gate() {
        let engine = MemEngine::new();
        engine.create_table("table:t", "S", "S").unwrap();
        engine.pause();
        let jh = std::thread::spawn({
            let mut c = cursor(&engine, "table:t");
            move || c.insert(b"k", b"v", true)
        });
        engine.wait_until_blocked(1);
        assert_eq!(engine.blocked(), 1);
        assert_eq!(engine.len("table:t"), 0);
        engine.resume();
        jh.join().unwrap().unwrap();
        assert_eq!(engine.blocked(), 0);
        assert_eq!(engine.len("table:t"), 1);
    }
}
