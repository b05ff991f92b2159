//! Server-push stream transport over `text/event-stream`.
//!
//! One long-lived GET whose response body is parsed incrementally: each
//! complete event frame yields exactly one inbound message. An incomplete
//! frame at end-of-stream is a protocol fault. Sending goes through the
//! shared batch send utility on separate POSTs.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::{InboundSink, TetherError, TetherResult, TransportSide};

use crate::http::{BodyStream, HttpClient};
use crate::transport::{send_util, Transport};

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Incremental `text/event-stream` parser.
///
/// Push raw body chunks in; pop complete event payloads out. Only `data:`
/// fields carry application bytes; multi-line data is joined with `\n`,
/// comment lines and other fields are ignored.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
    data_lines: Vec<Vec<u8>>,
    saw_data: bool,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every message completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.is_empty() {
                // Blank line terminates the frame.
                if self.saw_data {
                    messages.push(self.data_lines.join(&b'\n'));
                }
                self.data_lines.clear();
                self.saw_data = false;
            } else if let Some(rest) = strip_field(&line, b"data") {
                self.data_lines.push(rest.to_vec());
                self.saw_data = true;
            }
            // Comments (leading ':') and other fields are ignored.
        }
        messages
    }

    /// Validate end-of-stream: any buffered partial frame is a fault.
    pub fn finish(&self) -> TetherResult<()> {
        if self.buffer.is_empty() && !self.saw_data {
            Ok(())
        } else {
            Err(TetherError::Protocol(
                "event stream ended mid-frame".into(),
            ))
        }
    }
}

/// Strip `name:` (with optional single leading space in the value) from a
/// field line, if it matches.
fn strip_field<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let rest = line.strip_prefix(name)?;
    let rest = rest.strip_prefix(b":")?;
    Some(rest.strip_prefix(b" ").unwrap_or(rest))
}

pub struct SseTransport {
    http: Arc<dyn HttpClient>,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl SseTransport {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        SseTransport {
            http,
            running: None,
        }
    }

    async fn run_recv_loop(
        mut body: BodyStream,
        inbound: InboundSink,
        cancel: CancellationToken,
    ) -> TetherResult<()> {
        let mut parser = EventStreamParser::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TetherError::Canceled("event stream canceled".into()));
                }
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for message in parser.push(&bytes) {
                        inbound.write(message).await?;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    parser.finish()?;
                    tracing::debug!("event stream ended");
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&mut self, url: &str, side: TransportSide) -> TetherResult<()> {
        tracing::info!("starting event stream against {}", url);

        // Opening the stream is the transport-start step; its failure is a
        // start fault reported to the caller directly.
        let body = self.http.open_stream(url, EVENT_STREAM_MIME).await?;

        let cancel = CancellationToken::new();
        let sink = side.inbound;

        let recv_task = {
            let sink = sink.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = Self::run_recv_loop(body, sink, cancel.clone()).await;
                cancel.cancel();
                result
            })
        };

        let send_task = {
            let http = self.http.clone();
            let url = url.to_string();
            let cancel = cancel.clone();
            tokio::spawn(send_util::run_send_loop(http, url, side.outbound, cancel))
        };

        let supervisor = tokio::spawn(crate::transport::supervise(recv_task, send_task, sink));
        self.running = Some(Running { cancel, supervisor });
        Ok(())
    }

    async fn stop(&mut self) -> TetherResult<()> {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.supervisor.await;
        }
        Ok(())
    }
}
