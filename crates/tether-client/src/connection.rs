//! The connection orchestrator.
//!
//! `Connection` owns the lifecycle surface (`start`, `send`, `stop`):
//! negotiation, transport selection, the receive loop republishing inbound
//! payloads as events, and deterministic teardown. State moves through
//! `Initial → Connecting → {Connected | Disconnected} → Disconnected`, never
//! backwards, guarded by atomic compare-and-exchange rather than a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::{
    channel_pair, connect_url, ApplicationSide, Callbacks, ConnectionEvent, ConnectionState,
    EventQueue, SendEnvelope, StateCell, TetherError, TetherResult, TransportSet,
};

use crate::http::{HttpClient, HttpMethod, ReqwestClient};
use crate::negotiate::negotiate;
use crate::transport::{AnyTransport, TransportFactory};

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// HTTP method for the negotiation request (servers differ).
    pub negotiate_method: HttpMethod,
    /// Transports the client is willing to use.
    pub allowed_transports: TransportSet,
    /// Capacity of each direction of the channel pair.
    pub channel_capacity: usize,
    /// Grace period before a stuck socket loop is force-aborted on shutdown.
    pub close_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            negotiate_method: HttpMethod::Get,
            allowed_transports: TransportSet::all(),
            channel_capacity: 64,
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Shared result of the one connection attempt. The driving caller gets the
/// owned cause; everyone else resolves from this.
type StartOutcome = Result<(), Arc<TetherError>>;

/// Parts that exist only while a connection attempt is live.
struct Active {
    transport: Option<AnyTransport>,
    recv_loop: Option<JoinHandle<()>>,
}

/// One logical client-to-server session.
///
/// Terminal once disconnected; a new logical connection requires a new
/// instance. Built via [`ConnectionBuilder`].
pub struct Connection {
    endpoint: String,
    config: ConnectionConfig,
    http: Mutex<Option<Arc<dyn HttpClient>>>,
    state: Arc<StateCell>,
    factory: TransportFactory,
    events: Arc<EventQueue>,
    start_tx: watch::Sender<Option<StartOutcome>>,
    outbound: Mutex<Option<mpsc::Sender<SendEnvelope>>>,
    active: tokio::sync::Mutex<Active>,
    closed_emitted: Arc<AtomicBool>,
    start_claimed: AtomicBool,
    stop_called: AtomicBool,
}

impl Connection {
    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Establish the connection: negotiate, pick a transport, start it, and
    /// begin delivering events.
    ///
    /// Idempotent against concurrent calls: only the first caller drives the
    /// attempt; every caller observes the same outcome, and exactly one
    /// negotiation request is issued.
    pub async fn start(&self) -> TetherResult<()> {
        if self
            .state
            .transition(ConnectionState::Initial, ConnectionState::Connecting)
        {
            self.start_claimed.store(true, Ordering::SeqCst);
            let outcome = self.start_inner().await;
            let shared = match &outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(Arc::new(e.clone())),
            };
            // send_replace stores the outcome even while no subscriber is
            // live; losers and stop() subscribe later and must find it.
            self.start_tx.send_replace(Some(shared));
            return outcome;
        }

        // Lost the race (or start already happened): observe the in-flight
        // outcome instead of negotiating again.
        let mut rx = self.start_tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(TetherError::StartFailed);
            }
            // No outcome will ever arrive if the connection was stopped
            // before anyone claimed the start.
            if !self.start_claimed.load(Ordering::SeqCst)
                && self.state.load() == ConnectionState::Disconnected
            {
                return Err(TetherError::InvalidState(
                    "connection was stopped before it was started".into(),
                ));
            }
            if rx.changed().await.is_err() {
                return Err(TetherError::InvalidState(
                    "connection start outcome unavailable".into(),
                ));
            }
        }
    }

    async fn start_inner(&self) -> TetherResult<()> {
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.disconnect();
                // Cancellation from a racing stop closes cleanly; real faults
                // ride the Closed event.
                if e.is_canceled() {
                    self.emit_closed(None);
                } else {
                    self.emit_closed(Some(Arc::new(e.clone())));
                }
                Err(e)
            }
        }
    }

    async fn connect(&self) -> TetherResult<()> {
        let http = self
            .http
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TetherError::InvalidState("http client released".into()))?;

        let negotiated = negotiate(&http, &self.endpoint, self.config.negotiate_method).await?;
        let url = connect_url(&self.endpoint, &negotiated.connection_id);

        let kind = self.factory.select(negotiated.transports())?;

        let (mut app, transport_side) = channel_pair(self.config.channel_capacity);
        let mut transport = AnyTransport::new(kind, http, self.config.close_grace);

        if let Err(e) = transport.start(&url, transport_side).await {
            if matches!(e, TetherError::Unsupported(_)) {
                // Sticky: this kind is skipped for the rest of the process.
                self.factory.mark_websockets_unsupported();
            }
            return Err(e);
        }
        tracing::info!("{} transport started for {}", transport.kind(), url);

        // Connection keeps the only persistent outbound sender; the
        // application side's copy goes away so closing ours closes the queue.
        let sender = app.outbound()?.clone();
        app.close_outbound();

        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            // A racing stop already moved us to Disconnected.
            let _ = transport.stop().await;
            return Err(TetherError::Canceled(
                "connection stopped while starting".into(),
            ));
        }

        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);

        // Connected must be queued before the receive loop reads anything so
        // it is always observed before the first Received.
        self.events.enqueue(ConnectionEvent::Connected);

        let recv_loop = tokio::spawn(Self::receive_loop(
            app,
            self.events.clone(),
            self.state.clone(),
            self.closed_emitted.clone(),
        ));

        let mut active = self.active.lock().await;
        active.transport = Some(transport);
        active.recv_loop = Some(recv_loop);
        Ok(())
    }

    async fn receive_loop(
        mut app: ApplicationSide,
        events: Arc<EventQueue>,
        state: Arc<StateCell>,
        closed_emitted: Arc<AtomicBool>,
    ) {
        while let Some(payload) = app.recv().await {
            events.enqueue(ConnectionEvent::Received(payload));
        }

        // Inbound completion is the single authoritative end-of-connection
        // signal: pick up the transport's terminal fault and close out.
        let fault = app.take_fault().map(Arc::new);
        state.disconnect();
        if !closed_emitted.swap(true, Ordering::SeqCst) {
            events.enqueue(ConnectionEvent::Closed(fault));
        }
        tracing::debug!("receive loop ended");
    }

    fn emit_closed(&self, fault: Option<Arc<TetherError>>) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            self.events.enqueue(ConnectionEvent::Closed(fault));
        }
    }

    /// Queue one payload for transmission and wait until the transport has
    /// shipped it (or failed to).
    ///
    /// Rejected immediately unless the connection is `Connected`. `cancel`
    /// aborts only the wait for queue capacity, never the transmission of a
    /// message the transport already accepted.
    pub async fn send_with_cancel(
        &self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> TetherResult<()> {
        if self.state.load() != ConnectionState::Connected {
            return Err(TetherError::InvalidState(
                "cannot send: connection is not connected".into(),
            ));
        }
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TetherError::InvalidState(
                "cannot send: connection is not connected".into(),
            ))?;

        let (envelope, done) = SendEnvelope::new(payload);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TetherError::Canceled("send canceled while queueing".into()));
            }
            result = sender.send(envelope) => {
                result.map_err(|_| TetherError::Channel("outbound queue closed".into()))?;
            }
        }

        // Accepted: the completion signal resolves regardless of the token.
        match done.await {
            Ok(result) => result,
            Err(_) => Err(TetherError::Channel(
                "transport dropped the message completion".into(),
            )),
        }
    }

    /// [`send_with_cancel`](Self::send_with_cancel) without a caller token.
    pub async fn send(&self, payload: Vec<u8>) -> TetherResult<()> {
        let never = CancellationToken::new();
        self.send_with_cancel(payload, &never).await
    }

    /// Tear the connection down.
    ///
    /// Unconditional and idempotent. Waits, in order: the in-flight start,
    /// the transport's stop, the receive loop, and the event-queue drain, so
    /// teardown is deterministic. `Closed` has fired (exactly once) by the
    /// time this returns.
    pub async fn stop(&self) -> TetherResult<()> {
        let previous = self.state.disconnect();
        if self.stop_called.swap(true, Ordering::SeqCst) {
            // Repeat call: the first stop owns the teardown.
            return Ok(());
        }
        if previous == ConnectionState::Initial {
            // Never started: there is nothing to wait for.
            self.http.lock().unwrap_or_else(|e| e.into_inner()).take();
            return Ok(());
        }

        // Await the in-flight start, success or failure ignored.
        let mut rx = self.start_tx.subscribe();
        while rx.borrow_and_update().is_none() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        // Mark the outbound queue complete; the transport drains what was
        // already accepted, then its send loop ends.
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut active = self.active.lock().await;
        if let Some(mut transport) = active.transport.take() {
            if let Err(e) = transport.stop().await {
                tracing::warn!("transport stop reported: {}", e);
            }
        }
        if let Some(handle) = active.recv_loop.take() {
            let _ = handle.await;
        }
        drop(active);

        self.events.drain().await;
        self.http.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::info!("connection stopped");
        Ok(())
    }
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    endpoint: String,
    config: ConnectionConfig,
    callbacks: Callbacks,
    http: Option<Arc<dyn HttpClient>>,
    websockets_unsupported: Arc<AtomicBool>,
}

impl ConnectionBuilder {
    /// Target the given base endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        ConnectionBuilder {
            endpoint: endpoint.into(),
            config: ConnectionConfig::default(),
            callbacks: Callbacks::default(),
            http: None,
            websockets_unsupported: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Substitute the HTTP collaborator (tests, instrumentation).
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Share the process-wide "WebSockets unsupported" flag between
    /// connections so the sticky fallback outlives any one instance.
    pub fn websockets_unsupported_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.websockets_unsupported = flag;
        self
    }

    pub fn on_connected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connected = Some(Box::new(callback));
        self
    }

    pub fn on_received(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_received = Some(Box::new(callback));
        self
    }

    pub fn on_closed(
        mut self,
        callback: impl Fn(Option<&TetherError>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_closed = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Connection {
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestClient::new()) as Arc<dyn HttpClient>);
        let (start_tx, _) = watch::channel(None);

        Connection {
            endpoint: self.endpoint,
            factory: TransportFactory::new(
                self.config.allowed_transports,
                self.websockets_unsupported,
            ),
            config: self.config,
            http: Mutex::new(Some(http)),
            state: Arc::new(StateCell::new()),
            events: Arc::new(EventQueue::new(self.callbacks)),
            start_tx,
            outbound: Mutex::new(None),
            active: tokio::sync::Mutex::new(Active {
                transport: None,
                recv_loop: None,
            }),
            closed_emitted: Arc::new(AtomicBool::new(false)),
            start_claimed: AtomicBool::new(false),
            stop_called: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::FakeHttpClient;
    use crate::http::HttpResponse;
    use std::sync::Mutex as StdMutex;
    use tether_core::TransportKind;

    const ENDPOINT: &str = "https://example.com/chat";

    fn negotiate_body(transports: &str) -> TetherResult<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: format!(
                r#"{{"connectionId":"abc123","availableTransports":[{transports}]}}"#
            )
            .into_bytes(),
        })
    }

    fn status(code: u16) -> TetherResult<HttpResponse> {
        Ok(HttpResponse {
            status: code,
            body: Vec::new(),
        })
    }

    fn payload(body: &[u8]) -> TetherResult<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: body.to_vec(),
        })
    }

    type Log = Arc<StdMutex<Vec<String>>>;

    fn logging_builder(http: FakeHttpClient) -> (ConnectionBuilder, Log) {
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        let l3 = log.clone();
        let builder = ConnectionBuilder::new(ENDPOINT)
            .http_client(Arc::new(http))
            .on_connected(move || l1.lock().unwrap().push("connected".into()))
            .on_received(move |data| {
                l2.lock()
                    .unwrap()
                    .push(format!("received:{}", String::from_utf8_lossy(data)));
            })
            .on_closed(move |fault| {
                l3.lock().unwrap().push(match fault {
                    Some(_) => "closed:fault".into(),
                    None => "closed:clean".into(),
                });
            });
        (builder, log)
    }

    async fn wait_until(log: &Log, pred: impl Fn(&[String]) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&log.lock().unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected events did not arrive");
    }

    #[tokio::test]
    async fn long_polling_lifecycle_delivers_ordered_events() {
        let http = FakeHttpClient::new();
        let mut requests = 0;
        http.set_handler(move |_method, _url, _body| {
            requests += 1;
            match requests {
                1 => negotiate_body(r#""LongPolling""#),
                2 => payload(b"hello"),
                _ => status(204),
            }
        });
        let recorded = http.requests();
        let (builder, log) = logging_builder(http);
        let connection = builder.build();

        connection.start().await.unwrap();
        wait_until(&log, |l| l.iter().any(|e| e.starts_with("closed"))).await;

        // Connected strictly first, Closed strictly last, clean finish.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["connected", "received:hello", "closed:clean"]
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // The poll went to the connect URL with the negotiated id appended.
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded[0].1, ENDPOINT);
        assert_eq!(recorded[1].1, format!("{ENDPOINT}?id=abc123"));
    }

    #[tokio::test]
    async fn failed_negotiation_faults_start_and_closes_once() {
        let http = FakeHttpClient::new();
        http.respond_with(HttpResponse {
            status: 500,
            body: Vec::new(),
        });
        let (builder, log) = logging_builder(http);
        let connection = builder.build();

        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, TetherError::Negotiate(_)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.stop().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["closed:fault"]);
    }

    #[tokio::test]
    async fn selection_fault_when_no_common_transport() {
        let http = FakeHttpClient::new();
        http.set_handler(|_m, _u, _b| negotiate_body(r#""WebSockets""#));
        let (builder, log) = logging_builder(http);
        let config = ConnectionConfig {
            allowed_transports: [TransportKind::LongPolling].into_iter().collect(),
            ..ConnectionConfig::default()
        };
        let connection = builder.config(config).build();

        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, TetherError::NoTransport(_)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.stop().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["closed:fault"]);
    }

    #[tokio::test]
    async fn concurrent_starts_negotiate_once_and_agree() {
        let http = FakeHttpClient::new();
        let mut requests = 0;
        http.set_handler(move |_m, _u, _b| {
            requests += 1;
            match requests {
                1 => negotiate_body(r#""LongPolling""#),
                _ => status(204),
            }
        });
        let recorded = http.requests();
        let (builder, _log) = logging_builder(http);
        let connection = builder.build();

        let (a, b) = tokio::join!(connection.start(), connection.start());
        assert!(a.is_ok());
        assert!(b.is_ok());

        // Exactly one negotiation request against the base endpoint.
        let negotiations = recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, url, _)| url == ENDPOINT)
            .count();
        assert_eq!(negotiations, 1);

        connection.stop().await.unwrap();
    }

    #[tokio::test]
    async fn later_start_observes_the_stored_outcome() {
        let http = FakeHttpClient::new();
        http.respond_with(HttpResponse {
            status: 500,
            body: Vec::new(),
        });
        let (builder, _log) = logging_builder(http);
        let connection = builder.build();

        // The driving caller gets the underlying cause.
        let first = connection.start().await.unwrap_err();
        assert!(matches!(first, TetherError::Negotiate(_)));

        // A caller arriving after the attempt finished resolves from the
        // stored outcome instead of negotiating again, and shares the cause.
        let second = connection.start().await.unwrap_err();
        match second {
            TetherError::StartFailed(cause) => {
                assert!(matches!(*cause, TetherError::Negotiate(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        connection.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_is_rejected_unless_connected() {
        let http = FakeHttpClient::new();
        let recorded = http.requests();
        let (builder, _log) = logging_builder(http);
        let connection = builder.build();

        let err = connection.send(b"early".to_vec()).await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidState(_)));
        // No network I/O happened.
        assert!(recorded.lock().unwrap().is_empty());

        connection.stop().await.unwrap();
        let err = connection.send(b"late".to_vec()).await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidState(_)));
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_over_sse_round_trips_completion() {
        let http = FakeHttpClient::new();
        http.set_handler(|method, _url, _body| match method {
            HttpMethod::Get => negotiate_body(r#""ServerSentEvents""#),
            _ => status(200),
        });
        // A stream that stays open keeps the transport running.
        http.push_stream(Box::pin(futures_util::stream::pending()));
        let recorded = http.requests();
        let (builder, log) = logging_builder(http);
        let connection = builder.build();

        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.send(b"ping".to_vec()).await.unwrap();
        {
            let recorded = recorded.lock().unwrap();
            let post = recorded
                .iter()
                .find(|(method, _, _)| *method == HttpMethod::Post)
                .expect("send issued no POST");
            assert_eq!(post.1, format!("{ENDPOINT}?id=abc123"));
            assert_eq!(post.2, b"ping");
        }

        connection.stop().await.unwrap();
        // Drain completed before stop returned: Closed is already observable
        // and was clean.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["connected", "closed:clean"]
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_stop_first_wins() {
        let http = FakeHttpClient::new();
        let (builder, log) = logging_builder(http);
        let connection = builder.build();

        // Stop before start: nothing happened, nothing fires.
        connection.stop().await.unwrap();
        connection.stop().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(log.lock().unwrap().is_empty());

        // A start after stop cannot resurrect the connection.
        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidState(_)));
    }

    #[tokio::test]
    async fn mid_flight_transport_fault_reaches_closed() {
        let http = FakeHttpClient::new();
        let mut requests = 0;
        http.set_handler(move |_m, _u, _b| {
            requests += 1;
            match requests {
                1 => negotiate_body(r#""LongPolling""#),
                2 => payload(b"one"),
                _ => status(503),
            }
        });
        let (builder, log) = logging_builder(http);
        let connection = builder.build();

        connection.start().await.unwrap();
        wait_until(&log, |l| l.iter().any(|e| e.starts_with("closed"))).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["connected", "received:one", "closed:fault"]
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        connection.stop().await.unwrap();
    }
}
