use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use bytes::Bytes;

use crate::{engine::EngineError, Callback, CompletedOp, OpError, OpResult, OpType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ok,
    NotFound,
    DuplicateKey,
    Io,
    Other(String),
    NoSuchSource,
    Cancelled,
}

impl From<&OpResult> for Outcome {
    fn from(result: &OpResult) -> Self {
        match result {
            Ok(()) => Outcome::Ok,
            Err(OpError::Cancelled) => Outcome::Cancelled,
            Err(OpError::Engine(e)) => match e {
                EngineError::NotFound => Outcome::NotFound,
                EngineError::DuplicateKey => Outcome::DuplicateKey,
                EngineError::Io(_) => Outcome::Io,
                EngineError::NoSuchSource(_) => Outcome::NoSuchSource,
                EngineError::Other(msg) => Outcome::Other(msg.clone()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Event {
    pub(crate) id: u64,
    pub(crate) op_type: Option<OpType>,
    pub(crate) outcome: Outcome,
    pub(crate) value: Option<Bytes>,
    pub(crate) thread: Option<String>,
}

/// Callback that records every completion.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Event>>,
    cond: Condvar,
}

impl Callback for Recorder {
    fn notify(&self, op: &CompletedOp<'_>, result: OpResult) {
        let event = Event {
            id: op.id(),
            op_type: op.op_type(),
            outcome: Outcome::from(&result),
            value: op.encoded_value().map(Bytes::copy_from_slice),
            thread: std::thread::current().name().map(str::to_owned),
        };
        self.events.lock().unwrap().push(event);
        self.cond.notify_all();
    }
}

impl Recorder {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Wait until at least `n` completions were recorded.
    pub(crate) fn wait_for(&self, n: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap();
        let (events, timeout) = self
            .cond
            .wait_timeout_while(events, Duration::from_secs(10), |events| events.len() < n)
            .unwrap();
        assert!(
            !timeout.timed_out(),
            "waited for {n} completions, got {}",
            events.len()
        );
        events.clone()
    }

    pub(crate) fn outcome_of(&self, id: u64) -> Option<Outcome> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.outcome.clone())
    }
}
