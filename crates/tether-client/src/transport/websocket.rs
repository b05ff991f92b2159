//! Full-duplex WebSocket transport.
//!
//! One physical connection, two independently scheduled loops: the receive
//! loop reads frames straight into the inbound queue, the send loop drains
//! the outbound queue and writes each batch as a single binary frame. The
//! loops share one cancellation token, so either side failing stops both.
//!
//! Shutdown is asymmetric: the peer may stop reading while we still have
//! sends buffered, or keep sending after we stop reading. Whichever side is
//! stuck past the configured grace period is force-aborted rather than
//! awaited forever.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tether_core::{InboundSink, SendEnvelope, TetherError, TetherResult, TransportSide};

use crate::transport::{ws_url, Transport};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct WebSocketTransport {
    close_grace: Duration,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    recv_abort: AbortHandle,
    send_abort: AbortHandle,
}

impl WebSocketTransport {
    pub fn new(close_grace: Duration) -> Self {
        WebSocketTransport {
            close_grace,
            running: None,
        }
    }

    async fn run_recv_loop(
        mut read: WsRead,
        inbound: InboundSink,
        cancel: CancellationToken,
    ) -> TetherResult<()> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TetherError::Canceled("websocket receive canceled".into()));
                }
                message = read.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => inbound.write(data).await?,
                Some(Ok(Message::Text(text))) => inbound.write(text.into_bytes()).await?,
                Some(Ok(Message::Close(frame))) => {
                    // A non-normal close status from the peer is an error,
                    // not a clean finish.
                    match frame {
                        Some(frame) if frame.code != CloseCode::Normal => {
                            return Err(TetherError::Transport(format!(
                                "websocket closed with status {}: {}",
                                u16::from(frame.code),
                                frame.reason
                            )));
                        }
                        _ => {
                            tracing::debug!("websocket closed by peer");
                            return Ok(());
                        }
                    }
                }
                Some(Ok(_)) => continue, // ping/pong/raw frames
                Some(Err(e)) => {
                    return Err(TetherError::Transport(format!(
                        "websocket read error: {e}"
                    )));
                }
                None => {
                    tracing::debug!("websocket stream ended");
                    return Ok(());
                }
            }
        }
    }

    async fn run_send_loop(
        mut sink: WsSink,
        mut outbound: mpsc::Receiver<SendEnvelope>,
        cancel: CancellationToken,
    ) -> TetherResult<()> {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(TetherError::Canceled("websocket send canceled".into()));
                }
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => {
                        // Orderly close: application finished sending.
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                },
            };

            // Everything buffered right now goes out as one frame.
            let mut batch = vec![first];
            while let Ok(envelope) = outbound.try_recv() {
                batch.push(envelope);
            }
            let mut frame = Vec::new();
            for envelope in &batch {
                frame.extend_from_slice(envelope.payload());
            }

            match sink.send(Message::Binary(frame)).await {
                Ok(()) => {
                    for envelope in batch {
                        envelope.complete();
                    }
                }
                Err(e) => {
                    let err = TetherError::Transport(format!("websocket write error: {e}"));
                    for envelope in batch {
                        envelope.fail(&err);
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn classify_connect_error(e: WsError) -> TetherError {
    match e {
        // The socket kind itself is unusable here; the factory's sticky
        // fallback keys off this classification.
        WsError::Url(e) => TetherError::Unsupported(format!("websocket url rejected: {e}")),
        other => TetherError::Transport(format!("websocket connect error: {other}")),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&mut self, url: &str, side: TransportSide) -> TetherResult<()> {
        let ws = ws_url(url)?;
        let (stream, _response) = connect_async(&ws).await.map_err(classify_connect_error)?;
        tracing::info!("websocket connected to {}", ws);

        let (sink, read) = stream.split();
        let cancel = CancellationToken::new();
        let inbound = side.inbound;

        let recv_task = {
            let inbound = inbound.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = Self::run_recv_loop(read, inbound, cancel.clone()).await;
                cancel.cancel();
                result
            })
        };

        let send_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = Self::run_send_loop(sink, side.outbound, cancel.clone()).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            })
        };

        let recv_abort = recv_task.abort_handle();
        let send_abort = send_task.abort_handle();
        let supervisor = tokio::spawn(crate::transport::supervise(recv_task, send_task, inbound));

        self.running = Some(Running {
            cancel,
            supervisor,
            recv_abort,
            send_abort,
        });
        Ok(())
    }

    async fn stop(&mut self) -> TetherResult<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        running.cancel.cancel();

        // Give both loops a bounded grace period to finish the close
        // handshake, then abort whichever is stuck.
        if tokio::time::timeout(self.close_grace, &mut running.supervisor)
            .await
            .is_err()
        {
            tracing::warn!("websocket loops did not stop in time; aborting");
            running.recv_abort.abort();
            running.send_abort.abort();
            let _ = running.supervisor.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_errors_classify_as_unsupported() {
        let err = classify_connect_error(WsError::Url(
            tokio_tungstenite::tungstenite::error::UrlError::EmptyHostName,
        ));
        assert!(matches!(err, TetherError::Unsupported(_)));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let mut transport = WebSocketTransport::new(Duration::from_secs(1));
        transport.stop().await.unwrap();
    }
}
