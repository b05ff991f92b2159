//! Long-polling transport.
//!
//! Repeatedly issues a GET against the connect URL. A `204 No Content` (or
//! cancellation) ends the poll loop cleanly; any other success status with a
//! non-empty body yields one inbound message. HTTP-level failures surface as
//! poll faults, never swallowed. Sending goes through the shared batch
//! send utility.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::{InboundSink, TetherError, TetherResult, TransportSide};

use crate::http::{HttpClient, HttpMethod};
use crate::transport::{send_util, Transport};

const NO_CONTENT: u16 = 204;

pub struct LongPollingTransport {
    http: Arc<dyn HttpClient>,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl LongPollingTransport {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        LongPollingTransport {
            http,
            running: None,
        }
    }

    async fn run_poll_loop(
        http: Arc<dyn HttpClient>,
        url: String,
        inbound: InboundSink,
        cancel: CancellationToken,
    ) -> TetherResult<()> {
        let mut polls: u64 = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("poll loop canceled after {} poll(s)", polls);
                    return Err(TetherError::Canceled("poll loop canceled".into()));
                }
                result = http.request(HttpMethod::Get, &url, Vec::new()) => result,
            };
            polls += 1;

            match result {
                Ok(response) if response.status == NO_CONTENT => {
                    tracing::debug!("server ended session after {} poll(s)", polls);
                    return Ok(());
                }
                Ok(response) if response.is_success() => {
                    if !response.body.is_empty() {
                        inbound.write(response.body).await?;
                    }
                }
                Ok(response) => {
                    return Err(TetherError::Http(format!(
                        "poll of {url} returned status {}",
                        response.status
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    async fn start(&mut self, url: &str, side: TransportSide) -> TetherResult<()> {
        tracing::info!("starting long polling against {}", url);

        let cancel = CancellationToken::new();
        let sink = side.inbound;

        let recv_task = {
            let http = self.http.clone();
            let url = url.to_string();
            let sink = sink.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = Self::run_poll_loop(http, url, sink, cancel.clone()).await;
                // Stop the paired send loop whichever way the polling ended.
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
