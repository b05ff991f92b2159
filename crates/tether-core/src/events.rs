//! Strictly ordered event dispatch.
//!
//! Lifecycle callbacks (`Connected`, `Received`, `Closed`) run on a single
//! background worker, one at a time, in enqueue order. Producers never block
//! beyond queuing. A panicking callback is caught and logged so one
//! misbehaving subscriber cannot stall delivery of later events (in
//! particular `Closed`, which teardown waits on).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TetherError;

/// A client-visible lifecycle event.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The connection reached `Connected`. Always first.
    Connected,
    /// One application message arrived.
    Received(Vec<u8>),
    /// The connection ended. `None` for a clean stop, the causing fault
    /// otherwise. Always last, fired exactly once. Shared because the same
    /// fault may also reject a pending `start`.
    Closed(Option<Arc<TetherError>>),
}

/// Application-registered callbacks. Unset callbacks are no-ops.
#[derive(Default)]
pub struct Callbacks {
    pub on_connected: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_received: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_closed: Option<Box<dyn Fn(Option<&TetherError>) + Send + Sync>>,
}

enum QueueItem {
    Event(ConnectionEvent, oneshot::Sender<()>),
    Flush(oneshot::Sender<()>),
}

/// Resolves once the enqueued event's callback has finished running.
pub struct EnqueueHandle(oneshot::Receiver<()>);

impl EnqueueHandle {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// The sequential dispatch queue.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    _worker: JoinHandle<()>,
}

impl EventQueue {
    pub fn new(callbacks: Callbacks) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx, callbacks));
        EventQueue { tx, _worker: worker }
    }

    /// Append an event to the dispatch chain. Never blocks.
    pub fn enqueue(&self, event: ConnectionEvent) -> EnqueueHandle {
        let (done, rx) = oneshot::channel();
        // A closed worker means teardown already drained; the handle then
        // resolves immediately via the dropped sender.
        let _ = self.tx.send(QueueItem::Event(event, done));
        EnqueueHandle(rx)
    }

    /// Wait until every previously enqueued event's callback has run.
    pub async fn drain(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(QueueItem::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<QueueItem>, callbacks: Callbacks) {
        while let Some(item) = rx.recv().await {
            match item {
                QueueItem::Event(event, done) => {
                    Self::dispatch(&callbacks, event);
                    let _ = done.send(());
                }
                QueueItem::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("event dispatch worker ended");
    }

    fn dispatch(callbacks: &Callbacks, event: ConnectionEvent) {
        let result = catch_unwind(AssertUnwindSafe(|| match &event {
            ConnectionEvent::Connected => {
                if let Some(cb) = &callbacks.on_connected {
                    cb();
                }
            }
            ConnectionEvent::Received(payload) => {
                if let Some(cb) = &callbacks.on_received {
                    cb(payload);
                }
            }
            ConnectionEvent::Closed(fault) => {
                if let Some(cb) = &callbacks.on_closed {
                    cb(fault.as_deref());
                }
            }
        }));
        if result.is_err() {
            tracing::warn!("event callback panicked; continuing dispatch");
        }
    }
}
