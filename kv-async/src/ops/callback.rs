//! Completion notification.
//!
//! Every op handed to a worker gets exactly one [`Callback::notify`] call,
//! on the worker thread that executed it, or on the thread running shutdown
//! if the op was cancelled.

use std::sync::Arc;

use bytes::Bytes;

use super::{OpResult, OpType};
use crate::CompletedOp;

pub trait Callback: Send + Sync {
    /// `op` is only valid for the duration of the call; copy out what you need.
    ///
    /// Must not call [`SubsystemHandle::flush`](crate::SubsystemHandle::flush),
    /// which fails with [`Error::FlushFromCallback`](crate::Error::FlushFromCallback).
    fn notify(&self, op: &CompletedOp<'_>, result: OpResult);
}

struct FnCallback<F>(F);

impl<F> Callback for FnCallback<F>
where
    F: Fn(&CompletedOp<'_>, OpResult) + Send + Sync,
{
    fn notify(&self, op: &CompletedOp<'_>, result: OpResult) {
        (self.0)(op, result)
    }
}

/// Wrap a closure.
pub fn from_fn<F>(f: F) -> Arc<dyn Callback>
where
    F: Fn(&CompletedOp<'_>, OpResult) + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// Owned copy of a completed op, produced by [`channel`].
#[derive(Debug)]
pub struct Completion {
    pub id: u64,
    /// `None` if the op was cancelled before it was submitted.
    pub op_type: Option<OpType>,
    /// The key as handed to the engine; record numbers are packed.
    pub key: Option<Bytes>,
    /// The value as handed to the engine, or found by a search.
    pub value: Option<Bytes>,
    pub result: OpResult,
}

struct ChannelCallback {
    tx: tokio::sync::mpsc::UnboundedSender<Completion>,
}

impl Callback for ChannelCallback {
    fn notify(&self, op: &CompletedOp<'_>, result: OpResult) {
        let completion = Completion {
            id: op.id(),
            op_type: op.op_type(),
            key: op.encoded_key().map(Bytes::copy_from_slice),
            value: op.encoded_value().map(Bytes::copy_from_slice),
            result,
        };
        // ignore send errors, the receiver may have lost interest
        let _ = self.tx.send(completion);
    }
}

/// Receiving half of [`channel`].
pub struct CompletionReceiver {
    rx: tokio::sync::mpsc::UnboundedReceiver<Completion>,
}

impl CompletionReceiver {
    pub async fn recv(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Must not be called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<Completion> {
        self.rx.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

/// A callback that forwards every completion to the returned receiver.
///
/// The same callback can be shared by any number of ops.
pub fn channel() -> (Arc<dyn Callback>, CompletionReceiver) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (
        Arc::new(ChannelCallback { tx }),
        CompletionReceiver { rx },
    )
}
