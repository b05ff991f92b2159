//! The in-memory channel pair connecting the application side of a
//! connection to the active transport.
//!
//! Two unidirectional queues:
//! - application → transport: [`SendEnvelope`]s, each carrying a payload and a
//!   completion signal the sender awaits.
//! - transport → application: raw inbound payloads, terminated by the
//!   transport completing the [`InboundSink`] with an optional fault.
//!
//! A pair is owned by exactly one (connection, transport) pairing and is never
//! reused across attempts.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::error::{TetherError, TetherResult};

/// An outbound payload paired with its delivery completion signal.
///
/// The transport's send loop is the only writer of the signal: it resolves it
/// once the payload has been shipped, or rejects it with the transmission
/// error.
#[derive(Debug)]
pub struct SendEnvelope {
    payload: Vec<u8>,
    done: oneshot::Sender<TetherResult<()>>,
}

impl SendEnvelope {
    /// Wrap `payload`, returning the envelope and the receiver the original
    /// sender awaits.
    pub fn new(payload: Vec<u8>) -> (Self, oneshot::Receiver<TetherResult<()>>) {
        let (done, rx) = oneshot::channel();
        (SendEnvelope { payload, done }, rx)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Report successful transmission. The sender may have gone away; that is
    /// not an error.
    pub fn complete(self) {
        let _ = self.done.send(Ok(()));
    }

    /// Report failed transmission.
    ///
    /// Cancellation is preserved as [`TetherError::Canceled`]; everything else
    /// is surfaced as a transport error carrying the cause's message, so a
    /// whole batch can be rejected with one shared cause.
    pub fn fail(self, cause: &TetherError) {
        let err = if cause.is_canceled() {
            TetherError::Canceled(cause.to_string())
        } else {
            TetherError::Transport(cause.to_string())
        };
        let _ = self.done.send(Err(err));
    }
}

/// Transport-held write end of the inbound (transport → application) queue.
///
/// Cloneable so a transport's receive loop and its supervisor can both hold
/// it; the queue completes once every clone is dropped. `complete` records the
/// terminal fault (first writer wins) before the drop.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::Sender<Vec<u8>>,
    fault: Arc<Mutex<Option<TetherError>>>,
}

impl InboundSink {
    /// Push one inbound payload toward the application.
    pub async fn write(&self, payload: Vec<u8>) -> TetherResult<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| TetherError::Channel("inbound queue closed".into()))
    }

    /// Record the terminal outcome of this transport: `None` for a clean
    /// finish, `Some(fault)` otherwise. Only the first recorded fault is kept.
    pub fn complete(&self, fault: Option<TetherError>) {
        if let Some(err) = fault {
            let mut slot = self.fault.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }
}

/// Application-held ends of the channel pair.
#[derive(Debug)]
pub struct ApplicationSide {
    outbound: Option<mpsc::Sender<SendEnvelope>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    fault: Arc<Mutex<Option<TetherError>>>,
}

impl ApplicationSide {
    /// The outbound queue, or an invalid-state error if already closed.
    pub fn outbound(&self) -> TetherResult<&mpsc::Sender<SendEnvelope>> {
        self.outbound
            .as_ref()
            .ok_or_else(|| TetherError::Channel("outbound queue closed".into()))
    }

    /// Receive the next inbound payload; `None` once the transport has
    /// finished and the queue is drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Mark the outbound queue complete. No further sends are accepted; the
    /// transport's send loop drains what was already buffered, then stops.
    pub fn close_outbound(&mut self) {
        self.outbound = None;
    }

    /// Take the terminal fault recorded by the transport, if any. Meaningful
    /// only after [`recv`](Self::recv) has returned `None`.
    pub fn take_fault(&self) -> Option<TetherError> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Transport-held ends of the channel pair.
#[derive(Debug)]
pub struct TransportSide {
    pub outbound: mpsc::Receiver<SendEnvelope>,
    pub inbound: InboundSink,
}

/// Create a fresh channel pair for one connection attempt.
pub fn channel_pair(capacity: usize) -> (ApplicationSide, TransportSide) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let fault = Arc::new(Mutex::new(None));

    let app = ApplicationSide {
        outbound: Some(out_tx),
        inbound: in_rx,
        fault: fault.clone(),
    };
    let transport = TransportSide {
        outbound: out_rx,
        inbound: InboundSink { tx: in_tx, fault },
    };
    (app, transport)
}
