//! Websocket transport: one socket, one writer lock, one read task.
//!
//! DESIGN
//! ======
//! A [`Connection`] is dialed once and never reused after teardown. Two
//! background tasks run per connection:
//! - the read loop decodes every inbound text frame into [`Inbound`] and
//!   routes it: pongs wake the keepalive, notifies become
//!   [`TransportEvent::Notify`], responses resolve their pending entry.
//! - the keepalive sends `{"req":"ping"}` every interval under the writer
//!   lock and tears the connection down when no pong arrives in time.
//!
//! Teardown is idempotent. The first reason wins, every pending request is
//! failed with it, and a single [`TransportEvent::Closed`] is emitted. The
//! read loop's exit is the authoritative liveness signal.
//!
//! RESOLUTION
//! ==========
//! Pending entries are removed and resolved while the registry lock is held,
//! so a caller abandoning its request either removes the entry itself or
//! finds the response already waiting in its receiver. The response wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use frames::{CodecError, Inbound, NotifyEvent, RequestIdGenerator, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

use crate::config::KeepalivePolicy;
use crate::error::{Error, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Upper bound on flushing a close frame during teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// EVENTS
// =============================================================================

/// Out-of-band signal from a connection to whoever supervises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notify { generation: u64, event: NotifyEvent },
    Closed { generation: u64, reason: TransportError },
}

/// Parameters for one dial.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub endpoint: String,
    pub generation: u64,
    pub handshake_timeout: Duration,
    pub accept_invalid_certs: bool,
    pub keepalive: KeepalivePolicy,
}

// =============================================================================
// PENDING REGISTRY
// =============================================================================

type Waiter = oneshot::Sender<Result<Response, Error>>;

#[derive(Default)]
struct Registry {
    closed: Option<TransportError>,
    waiters: HashMap<String, Waiter>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered request awaiting its correlated response.
///
/// Dropping it without [`PendingRequest::wait`] completing deregisters the
/// entry.
pub struct PendingRequest<'a> {
    conn: &'a Connection,
    reqid: String,
    rx: oneshot::Receiver<Result<Response, Error>>,
    resolved: bool,
}

impl PendingRequest<'_> {
    #[must_use]
    pub fn reqid(&self) -> &str {
        &self.reqid
    }

    /// Suspend until the response or connection teardown arrives.
    ///
    /// # Errors
    ///
    /// The teardown reason when the connection dies first, with a pong
    /// timeout reported as [`Error::Timeout`]. [`Error::Protocol`] when the correlated
    /// response could not be decoded.
    pub async fn wait(&mut self) -> Result<Response, Error> {
        let outcome = match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Sender dropped without resolving: only possible once torn down.
            Err(_) => Err(Error::from_teardown(self.conn.closed_reason().unwrap_or(TransportError::Closed))),
        };
        self.resolved = true;
        outcome
    }

    /// Withdraw the request. Returns the response instead when it was
    /// already delivered.
    pub fn abandon(mut self) -> Option<Result<Response, Error>> {
        self.resolved = true;
        if self.conn.deregister(&self.reqid) {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.conn.deregister(&self.reqid);
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

pub struct Connection {
    generation: u64,
    endpoint: String,
    writer: tokio::sync::Mutex<WsSink>,
    ids: Mutex<RequestIdGenerator>,
    registry: Mutex<Registry>,
    pong: Notify,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
    span: tracing::Span,
}

impl Connection {
    /// Dial `options.endpoint` and start the read and keepalive tasks.
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`] when the handshake fails or exceeds
    /// `handshake_timeout`, [`TransportError::Tls`] for TLS setup failures.
    pub async fn dial(
        options: DialOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<Self>, TransportError> {
        let connector = if options.accept_invalid_certs { Some(insecure::connector()?) } else { None };

        let handshake = tokio_tungstenite::connect_async_tls_with_config(
            options.endpoint.as_str(),
            None,
            true,
            connector,
        );
        let (stream, _) = tokio::time::timeout(options.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::Connect(format!("handshake timed out after {:?}", options.handshake_timeout))
            })?
            .map_err(|e| TransportError::connect(&e))?;

        let span = tracing::info_span!("trim.conn", addr = %options.endpoint, generation = options.generation);
        let (sink, stream) = stream.split();

        let conn = Arc::new(Self {
            generation: options.generation,
            endpoint: options.endpoint,
            writer: tokio::sync::Mutex::new(sink),
            ids: Mutex::new(RequestIdGenerator::new()),
            registry: Mutex::new(Registry::default()),
            pong: Notify::new(),
            shutdown: CancellationToken::new(),
            events,
            span: span.clone(),
        });
        span.in_scope(|| info!("trim: connected"));

        tokio::spawn(read_loop(Arc::clone(&conn), stream).instrument(span.clone()));
        tokio::spawn(keepalive_loop(Arc::clone(&conn), options.keepalive).instrument(span));
        Ok(conn)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn back_id(&self) -> String {
        lock(&self.ids).back_id().to_owned()
    }

    /// Replace the routing token embedded in subsequently minted ids.
    pub fn set_back_id(&self, back_id: &str) {
        lock(&self.ids).set_back_id(back_id);
    }

    /// Mint a request id from the current clock and backID.
    #[must_use]
    pub fn next_request_id(&self) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        lock(&self.ids).next_id(now)
    }

    /// Register `reqid` so the read loop can resolve it.
    ///
    /// # Errors
    ///
    /// The teardown reason when the connection is already closed.
    pub fn register(&self, reqid: String) -> Result<PendingRequest<'_>, TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = lock(&self.registry);
            if let Some(reason) = &registry.closed {
                return Err(reason.clone());
            }
            registry.waiters.insert(reqid.clone(), tx);
        }
        Ok(PendingRequest { conn: self, reqid, rx, resolved: false })
    }

    /// Number of requests still registered.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.registry).waiters.len()
    }

    fn deregister(&self, reqid: &str) -> bool {
        lock(&self.registry).waiters.remove(reqid).is_some()
    }

    /// Write one text frame under the writer lock. A failed write tears the
    /// connection down.
    ///
    /// # Errors
    ///
    /// The teardown reason when closed, [`TransportError::Write`] otherwise.
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if let Some(reason) = self.closed_reason() {
            return Err(reason);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Text(text.into())).await {
            drop(writer);
            let reason = TransportError::write(&e);
            self.span.in_scope(|| warn!(error = %reason, "trim: write failed"));
            self.teardown(reason.clone());
            return Err(reason);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    #[must_use]
    pub fn closed_reason(&self) -> Option<TransportError> {
        lock(&self.registry).closed.clone()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Tear down with `reason` and flush a close frame to the peer.
    pub async fn close(&self, reason: TransportError) {
        self.teardown(reason);
        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(CLOSE_GRACE, writer.close()).await;
    }

    /// Fail every pending request and stop both tasks. Later calls are no-ops.
    pub(crate) fn teardown(&self, reason: TransportError) {
        let waiters = {
            let mut registry = lock(&self.registry);
            if registry.closed.is_some() {
                return;
            }
            registry.closed = Some(reason.clone());
            std::mem::take(&mut registry.waiters)
        };
        self.shutdown.cancel();

        self.span.in_scope(|| info!(reason = %reason, pending = waiters.len(), "trim: connection torn down"));
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::from_teardown(reason.clone())));
        }
        let _ = self.events.send(TransportEvent::Closed { generation: self.generation, reason });
    }

    fn dispatch(&self, text: &str) {
        match frames::decode_inbound(text) {
            Ok(Inbound::Pong) => {
                trace!("trim: pong");
                self.pong.notify_waiters();
            }
            Ok(Inbound::TaskInfo(task)) => debug!(%task, "trim: task info"),
            Ok(Inbound::Notify(event)) => {
                info!(%event, "trim: notify");
                let _ = self.events.send(TransportEvent::Notify { generation: self.generation, event });
            }
            Ok(Inbound::Response(response)) => {
                let reqid = response.reqid.clone();
                self.resolve(&reqid, Ok(response));
            }
            Err(CodecError::MalformedResponse { reqid, field }) => {
                warn!(%reqid, field, "trim: malformed response");
                let error = CodecError::MalformedResponse { reqid: reqid.clone(), field };
                self.resolve(&reqid, Err(Error::Protocol(error)));
            }
            Err(e) => warn!(error = %e, "trim: dropping undecodable frame"),
        }
    }

    fn resolve(&self, reqid: &str, outcome: Result<Response, Error>) {
        let mut registry = lock(&self.registry);
        match registry.waiters.remove(reqid) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => warn!(%reqid, "trim: response for unknown request"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

async fn read_loop(conn: Arc<Connection>, mut stream: SplitStream<WsStream>) {
    let reason = loop {
        tokio::select! {
            () = conn.shutdown.cancelled() => break None,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => conn.dispatch(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break Some(TransportError::PeerClosed),
                Some(Ok(Message::Binary(data))) => warn!(len = data.len(), "trim: dropping binary frame"),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(TransportError::read(&e)),
            },
        }
    };

    if let Some(reason) = reason {
        warn!(error = %reason, "trim: read loop ended");
        conn.teardown(reason);
    }
    let mut writer = conn.writer.lock().await;
    let _ = tokio::time::timeout(CLOSE_GRACE, writer.close()).await;
    debug!("trim: read loop exited");
}

async fn keepalive_loop(conn: Arc<Connection>, policy: KeepalivePolicy) {
    loop {
        tokio::select! {
            () = conn.shutdown.cancelled() => return,
            () = tokio::time::sleep(policy.interval) => {}
        }

        // Registered before the ping goes out so a fast pong is not missed.
        let pong = conn.pong.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        if conn.send_text(frames::PING.to_owned()).await.is_err() {
            return;
        }
        tokio::select! {
            () = conn.shutdown.cancelled() => return,
            () = &mut pong => {}
            () = tokio::time::sleep(policy.pong_timeout) => {
                warn!(timeout = ?policy.pong_timeout, "trim: pong missed");
                conn.teardown(TransportError::PongTimeout(policy.pong_timeout));
                return;
            }
        }
    }
}

// =============================================================================
// TLS
// =============================================================================

mod insecure {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use tokio_tungstenite::Connector;

    use crate::error::{Error, TransportError};

    /// Accepts any server certificate; signatures are still checked.
    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    pub(super) fn connector() -> Result<Connector, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        Ok(Connector::Rustls(Arc::new(config)))
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
