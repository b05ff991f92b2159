//! Shared outbound send loop for the HTTP-posting transports.
//!
//! Each wake-up drains *everything* currently queued, concatenates the
//! payloads, and ships the whole batch as one POST to the connect URL. Every
//! envelope in the batch resolves or rejects together with the request.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::{SendEnvelope, TetherError, TetherResult};

use crate::http::{HttpClient, HttpMethod};

/// Drain the application-outbound queue until it closes, fails, or is
/// canceled.
///
/// Returns `Ok(())` when the queue was closed cleanly (orderly stop). On any
/// other exit the shared token is canceled before the error propagates, so
/// the paired receive loop stops deterministically.
pub async fn run_send_loop(
    http: Arc<dyn HttpClient>,
    url: String,
    mut outbound: mpsc::Receiver<SendEnvelope>,
    cancel: CancellationToken,
) -> TetherResult<()> {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TetherError::Canceled("send loop canceled".into()));
            }
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    tracing::debug!("outbound queue closed; send loop ending");
                    return Ok(());
                }
            },
        };

        // Pull everything else already queued into the same batch.
        let mut batch = vec![first];
        while let Ok(envelope) = outbound.try_recv() {
            batch.push(envelope);
        }

        let mut buffer = Vec::new();
        for envelope in &batch {
            buffer.extend_from_slice(envelope.payload());
        }
        tracing::debug!("sending batch of {} message(s)", batch.len());

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                Err(TetherError::Canceled("send loop canceled".into()))
            }
            result = http.request(HttpMethod::Post, &url, buffer) => match result {
                Ok(response) if response.is_success() => Ok(()),
                Ok(response) => Err(TetherError::Http(format!(
                    "send to {url} returned status {}",
                    response.status
                ))),
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => {
                for envelope in batch {
                    envelope.complete();
                }
            }
            Err(err) => {
                for envelope in batch {
                    envelope.fail(&err);
                }
                cancel.cancel();
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::FakeHttpClient;
    use crate::http::HttpResponse;
    use tether_core::channel_pair;

    #[tokio::test]
    async fn batch_ships_as_one_post() {
        let http = FakeHttpClient::new();
        http.respond_with(HttpResponse {
            status: 200,
            body: Vec::new(),
        });
        let recorded = http.requests();
        let http: Arc<dyn HttpClient> = Arc::new(http);

        let (mut app, transport) = channel_pair(8);
        let mut waits = Vec::new();
        for payload in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
            let (envelope, done) = SendEnvelope::new(payload);
            app.outbound().unwrap().send(envelope).await.unwrap();
            waits.push(done);
        }
        app.close_outbound();

        run_send_loop(
            http,
            "https://example.com/chat?id=abc".into(),
            transport.outbound,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // One POST carrying the concatenation of all three payloads.
        let requests = recorded.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, HttpMethod::Post);
        assert_eq!(requests[0].2, b"onetwothree");

        for done in waits {
            assert!(done.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn failed_post_rejects_whole_batch() {
        let http = FakeHttpClient::new();
        http.respond_with(HttpResponse {
            status: 500,
            body: Vec::new(),
        });
        let http: Arc<dyn HttpClient> = Arc::new(http);

        let (mut app, transport) = channel_pair(8);
        let mut waits = Vec::new();
        for payload in [b"a".to_vec(), b"b".to_vec()] {
            let (envelope, done) = SendEnvelope::new(payload);
            app.outbound().unwrap().send(envelope).await.unwrap();
            waits.push(done);
        }
        app.close_outbound();

        let cancel = CancellationToken::new();
        let err = run_send_loop(
            http,
            "https://example.com/chat?id=abc".into(),
            transport.outbound,
            cancel.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TetherError::Http(_)));

        // The paired loop's token is canceled by the failure path.
        assert!(cancel.is_cancelled());
        for done in waits {
            assert!(matches!(
                done.await.unwrap(),
                Err(TetherError::Transport(_))
            ));
        }
    }

    #[tokio::test]
    async fn cancellation_rejects_with_canceled() {
        let http: Arc<dyn HttpClient> = Arc::new(FakeHttpClient::new());
        let (app, transport) = channel_pair(8);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_send_loop(
            http,
            "https://example.com/chat?id=abc".into(),
            transport.outbound,
            cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_canceled());
        drop(app);
    }

    #[tokio::test]
    async fn clean_close_ends_loop_without_io() {
        let http = FakeHttpClient::new();
        let recorded = http.requests();
        let http: Arc<dyn HttpClient> = Arc::new(http);

        let (mut app, transport) = channel_pair(8);
        app.close_outbound();

        run_send_loop(
            http,
            "https://example.com/chat?id=abc".into(),
            transport.outbound,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(recorded.lock().unwrap().is_empty());
    }
}
