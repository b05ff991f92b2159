//! Transport selection and dispatch.
//!
//! Three transports satisfy one contract: start pumping bytes between the
//! connect URL and a [`TransportSide`] channel pair, then stop on demand. The
//! factory picks one per connection attempt from the server's advertised set
//! intersected with the client's allowed set, in fixed priority order:
//! WebSockets, then Server-Sent Events, then long polling.

pub mod long_polling;
pub mod send_util;
pub mod sse;
pub mod websocket;

pub use long_polling::LongPollingTransport;
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tether_core::{TetherError, TetherResult, TransportKind, TransportSet, TransportSide};

use crate::http::HttpClient;

/// Shared contract all transports satisfy.
///
/// `start` takes ownership of the transport half of a fresh channel pair and
/// returns once both pump loops are running. `stop` cancels the loops, waits
/// for them bounded by the configured grace period, and completes the inbound
/// queue so the orchestrator observes the outcome.
#[async_trait]
pub trait Transport: Send {
    async fn start(&mut self, url: &str, side: TransportSide) -> TetherResult<()>;
    async fn stop(&mut self) -> TetherResult<()>;
}

/// Enum-dispatched transport.
///
/// Wraps the three implementations so we can hold one without
/// `dyn Transport` boxing at the orchestrator.
pub enum AnyTransport {
    WebSocket(WebSocketTransport),
    Sse(SseTransport),
    LongPolling(LongPollingTransport),
}

impl AnyTransport {
    /// Build the transport for `kind`.
    pub fn new(kind: TransportKind, http: Arc<dyn HttpClient>, close_grace: Duration) -> Self {
        match kind {
            TransportKind::WebSockets => {
                AnyTransport::WebSocket(WebSocketTransport::new(close_grace))
            }
            TransportKind::ServerSentEvents => AnyTransport::Sse(SseTransport::new(http)),
            TransportKind::LongPolling => {
                AnyTransport::LongPolling(LongPollingTransport::new(http))
            }
        }
    }

    pub async fn start(&mut self, url: &str, side: TransportSide) -> TetherResult<()> {
        match self {
            Self::WebSocket(t) => t.start(url, side).await,
            Self::Sse(t) => t.start(url, side).await,
            Self::LongPolling(t) => t.start(url, side).await,
        }
    }

    pub async fn stop(&mut self) -> TetherResult<()> {
        match self {
            Self::WebSocket(t) => t.stop().await,
            Self::Sse(t) => t.stop().await,
            Self::LongPolling(t) => t.stop().await,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::WebSocket(_) => TransportKind::WebSockets,
            Self::Sse(_) => TransportKind::ServerSentEvents,
            Self::LongPolling(_) => TransportKind::LongPolling,
        }
    }
}

/// Deterministic transport selection with sticky WebSockets fallback.
///
/// The "WebSockets unsupported" flag is shared, process-lifetime state
/// injected by the caller rather than a hidden static: once set, the socket
/// kind is skipped by every later selection.
pub struct TransportFactory {
    allowed: TransportSet,
    websockets_unsupported: Arc<AtomicBool>,
}

impl TransportFactory {
    pub fn new(allowed: TransportSet, websockets_unsupported: Arc<AtomicBool>) -> Self {
        TransportFactory {
            allowed,
            websockets_unsupported,
        }
    }

    /// Pick the first kind, in priority order, present in both the server's
    /// advertised set and the client's allowed set.
    pub fn select(&self, available: TransportSet) -> TetherResult<TransportKind> {
        let candidates = available.intersection(self.allowed);
        for kind in TransportKind::PRIORITY {
            if kind == TransportKind::WebSockets
                && self.websockets_unsupported.load(Ordering::Relaxed)
            {
                continue;
            }
            if candidates.contains(kind) {
                return Ok(kind);
            }
        }
        Err(TetherError::NoTransport(
            "no transport kind is supported by both client and server".into(),
        ))
    }

    /// Permanently skip WebSockets for the lifetime of the shared flag.
    pub fn mark_websockets_unsupported(&self) {
        self.websockets_unsupported.store(true, Ordering::Relaxed);
        tracing::warn!("WebSockets marked unsupported; will not be selected again");
    }
}

/// Await a transport's paired loops, then complete the inbound queue with the
/// first real fault. Cancellation is an orderly outcome, not a fault.
pub(crate) async fn supervise(
    recv_task: tokio::task::JoinHandle<TetherResult<()>>,
    send_task: tokio::task::JoinHandle<TetherResult<()>>,
    inbound: tether_core::InboundSink,
) {
    let recv = recv_task.await;
    let send = send_task.await;
    let fault = [recv, send]
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(Err(e)) if !e.is_canceled() => Some(e),
            Ok(_) => None,
            // A force-aborted loop is a deliberate shutdown, not a fault.
            Err(join) if join.is_cancelled() => None,
            Err(join) => Some(TetherError::Transport(format!(
                "transport task failed: {join}"
            ))),
        })
        .next();
    inbound.complete(fault);
    tracing::debug!("transport loops finished");
}

/// Convert an `http(s)` connect URL to the `ws(s)` scheme.
pub(crate) fn ws_url(url: &str) -> TetherResult<String> {
    let lower = url.to_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(url.to_string())
    } else if let Some(rest) = url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(TetherError::Unsupported(format!(
            "cannot derive a WebSocket URL from {url}"
        )))
    }
}
