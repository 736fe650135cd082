//! Session orchestrator: owns the current connection and keeps it
//! authenticated.
//!
//! DESIGN
//! ======
//! One `tokio::sync::Mutex` guards the current [`Connection`]. Every call
//! snapshots the handle under that lock and then releases it, so a call racing
//! a reconnect either runs on the new connection or fails with the old one's
//! teardown reason. It never hangs on a replaced socket.
//!
//! A supervisor task consumes [`TransportEvent`]s from every connection. It
//! rebroadcasts notifies, reconnects on `tokenExpired`/`privilegeChanged` or
//! on unexpected loss of the current connection, and runs the `user.active`
//! heartbeat. Events from superseded generations are ignored. A failed
//! [`Client::reconnect`] is handed to it to retry.
//!
//! The supervisor only holds a `Weak` reference between attempts, so the
//! session ends once the last [`Client`] is dropped. Shutdown cancels any
//! handshake in progress.
//!
//! AUTHENTICATION
//! ==============
//! 1. `util.crypto.getRSAPub` unsigned → public key + `si`
//! 2. no token yet: encrypted `user.login` → secret, backID, token
//! 3. token and secret held from an earlier login: encrypted
//!    `user.authToken` → backID. A rejected resume falls back to login on
//!    the same connection.
//!
//! The result is stored as one immutable [`SessionState`] swapped atomically.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use frames::NotifyEvent;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::user::{AUTH_TOKEN, AuthTokenRequest, AuthTokenResponse, LOGIN, LoginRequest, LoginResponse};
use crate::api::util::{Empty, GET_RSA_PUB, GetRsaPubResponse};
use crate::api::{RemoteAccessService, UserService, UtilService};
use crate::call::{self, CallOptions};
use crate::config::ClientConfig;
use crate::credentials::Credential;
use crate::error::{Error, Result, TransportError};
use crate::transport::{Connection, DialOptions, TransportEvent};

/// Buffered notifies per subscriber before the slowest one starts lagging.
const NOTIFY_CAPACITY: usize = 64;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    HandshakePublicKey,
    Authenticating,
    Ready,
    Reconnecting,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::HandshakePublicKey => "handshake_public_key",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Authentication state of the current session. Replaced whole on every
/// successful login or resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Session id from the most recent public-key exchange.
    pub si: String,
    pub token: Option<String>,
    pub back_id: String,
    pub uid: String,
    pub admin: bool,
    pub machine_id: String,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Handle to an authenticated appliance session. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    endpoint: String,
    credential: Credential,
    session: RwLock<Arc<SessionState>>,
    conn: Mutex<Option<Arc<Connection>>>,
    generation: AtomicU64,
    state: watch::Sender<ClientState>,
    notifications: broadcast::Sender<NotifyEvent>,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Generations whose explicit reconnect failed, for the supervisor to
    /// keep retrying.
    retries: mpsc::UnboundedSender<u64>,
    shutdown: CancellationToken,
}

impl Client {
    /// Dial, authenticate and start the supervisor.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] without login credentials, transport errors when
    /// the dial fails, and any handshake or login failure.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        if config.username.is_empty() || config.password.is_empty() {
            return Err(Error::Config("username and password are required".into()));
        }
        let endpoint = config.endpoint()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (retries, retries_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFY_CAPACITY);

        let inner = Arc::new(ClientInner {
            credential: Credential::new(config.key_rotation),
            config,
            endpoint,
            session: RwLock::new(Arc::new(SessionState::default())),
            conn: Mutex::new(None),
            generation: AtomicU64::new(0),
            state,
            notifications,
            events,
            retries,
            shutdown: CancellationToken::new(),
        });

        {
            let mut slot = inner.conn.lock().await;
            if let Err(e) = inner.establish(&mut slot).await {
                inner.state.send_replace(ClientState::Closed);
                inner.shutdown.cancel();
                return Err(e);
            }
        }

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx, retries_rx, inner.shutdown.clone()));
        Ok(Self { inner })
    }

    /// Replace the connection and re-authenticate. Calls still in flight on
    /// the old connection fail with [`TransportError::Superseded`]. After a
    /// failure the supervisor keeps retrying with backoff.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after [`Client::close`], otherwise dial and
    /// authentication failures.
    pub async fn reconnect(&self) -> Result<()> {
        let outcome = {
            let mut slot = self.inner.conn.lock().await;
            self.inner.replace(&mut slot).await
        };
        if let Err(e) = &outcome {
            if !matches!(e, Error::Closed) {
                let _ = self.inner.retries.send(self.inner.current_generation());
            }
        }
        outcome
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Every notify pushed by the appliance, including ones the client
    /// itself ignores.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<NotifyEvent> {
        self.inner.notifications.subscribe()
    }

    #[must_use]
    pub fn session(&self) -> Arc<SessionState> {
        self.inner.session()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Shut the session down. Later calls fail with [`Error::Closed`];
    /// closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.state.send_replace(ClientState::Closed);
        info!(addr = %self.inner.endpoint, "trim: client closed");

        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close(TransportError::Closed).await;
        }
    }

    /// Invoke `method` with a typed request and decode the typed response.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after shutdown, [`Error::Decode`] when the response
    /// does not fit `Resp`, and every call-layer failure.
    pub async fn invoke<Req, Resp>(&self, method: &str, request: &Req, options: CallOptions) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = call::request_body(request, None)?;
        let conn = self.inner.current().await?;
        let response = call::invoke(&conn, &self.inner.credential, method, body, &options).await?;
        call::decode(method, response)
    }

    /// Untyped variant of [`Client::invoke`]. Returns the whole response
    /// object.
    ///
    /// # Errors
    ///
    /// Same as [`Client::invoke`].
    pub async fn invoke_value(&self, method: &str, body: Value, options: CallOptions) -> Result<Value> {
        let conn = self.inner.current().await?;
        let response = call::invoke(&conn, &self.inner.credential, method, body, &options).await?;
        Ok(response.body)
    }

    #[must_use]
    pub fn util(&self) -> UtilService<'_> {
        UtilService::new(self)
    }

    #[must_use]
    pub fn user(&self) -> UserService<'_> {
        UserService::new(self)
    }

    #[must_use]
    pub fn remote_access(&self) -> RemoteAccessService<'_> {
        RemoteAccessService::new(self)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CONNECTION LIFECYCLE
// =============================================================================

impl ClientInner {
    fn session(&self) -> Arc<SessionState> {
        Arc::clone(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn store_session(&self, session: SessionState) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(session);
    }

    /// Move to `next` unless the client was already closed.
    fn set_state(&self, next: ClientState) {
        self.state.send_if_modified(|state| {
            if *state == next || *state == ClientState::Closed {
                return false;
            }
            info!(from = %state, to = %next, "trim: state changed");
            *state = next;
            true
        });
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Snapshot the current connection.
    async fn current(&self) -> Result<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let slot = self.conn.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        slot.clone().ok_or(Error::Transport(TransportError::Closed))
    }

    /// Close whatever is in `slot` and establish a fresh connection.
    async fn replace(&self, slot: &mut Option<Arc<Connection>>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        self.set_state(ClientState::Reconnecting);
        if let Some(old) = slot.take() {
            info!(generation = old.generation(), "trim: superseding connection");
            old.close(TransportError::Superseded).await;
        }
        self.establish(slot).await
    }

    /// Dial a new generation into `slot` and authenticate on it. On failure
    /// `slot` is left empty. Shutdown aborts the dial and every handshake
    /// call, yielding [`Error::Closed`].
    async fn establish(&self, slot: &mut Option<Arc<Connection>>) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ClientState::Connecting);

        let options = DialOptions {
            endpoint: self.endpoint.clone(),
            generation,
            handshake_timeout: self.config.handshake_timeout,
            accept_invalid_certs: self.config.accept_invalid_certs,
            keepalive: self.config.keepalive,
        };
        let conn = tokio::select! {
            () = self.shutdown.cancelled() => return Err(Error::Closed),
            dialed = Connection::dial(options, self.events.clone()) => dialed?,
        };
        self.set_state(ClientState::HandshakePublicKey);

        if let Err(e) = self.authenticate(&conn).await {
            conn.close(TransportError::Closed).await;
            if self.shutdown.is_cancelled() {
                debug!(generation, "trim: handshake abandoned by shutdown");
                return Err(Error::Closed);
            }
            warn!(generation, error = %e, "trim: authentication failed");
            return Err(e);
        }

        *slot = Some(conn);
        self.set_state(ClientState::Ready);
        Ok(())
    }

    async fn call_on<Req, Resp>(&self, conn: &Connection, method: &str, request: &Req, options: CallOptions) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = call::request_body(request, None)?;
        let response = call::invoke(conn, &self.credential, method, body, &options).await?;
        call::decode(method, response)
    }

    fn handshake_options(&self) -> CallOptions {
        CallOptions::new().cancel_on(self.shutdown.clone())
    }

    async fn authenticate(&self, conn: &Connection) -> Result<()> {
        let preflight: GetRsaPubResponse =
            self.call_on(conn, GET_RSA_PUB, &Empty {}, self.handshake_options().skip_sign()).await?;
        self.credential.set_public_key(&preflight.public_key)?;
        let si = preflight.si;
        self.set_state(ClientState::Authenticating);

        let previous = self.session();
        let resumed = match previous.token.as_deref() {
            Some(token) if self.credential.has_secret() => match self.resume(conn, &si, token, &previous).await {
                Ok(session) => Some(session),
                Err(e) if e.remote_code().is_some() => {
                    warn!(error = %e, "trim: token resume rejected, logging in");
                    None
                }
                Err(e) => return Err(e),
            },
            _ => None,
        };
        let session = match resumed {
            Some(session) => session,
            None => self.login(conn, &si).await?,
        };

        conn.set_back_id(&session.back_id);
        info!(uid = %session.uid, admin = session.admin, generation = conn.generation(), "trim: authenticated");
        self.store_session(session);
        Ok(())
    }

    async fn login(&self, conn: &Connection, si: &str) -> Result<SessionState> {
        let request = LoginRequest {
            user: self.config.username.clone(),
            password: self.config.password.clone(),
            device_type: self.config.device_type.clone(),
            device_name: self.config.device_name.clone(),
            stay: self.config.stay_logged_in,
        };
        let options = self.handshake_options().encrypt().session(si);
        let reply: LoginResponse = self.call_on(conn, LOGIN, &request, options).await?;
        self.credential.set_secret(&reply.secret)?;

        Ok(SessionState {
            si: si.to_owned(),
            token: Some(reply.token).filter(|token| !token.is_empty()),
            back_id: reply.back_id,
            uid: reply.uid,
            admin: reply.admin,
            machine_id: reply.machine_id,
        })
    }

    async fn resume(&self, conn: &Connection, si: &str, token: &str, previous: &SessionState) -> Result<SessionState> {
        let request = AuthTokenRequest { token: token.to_owned(), main: false };
        let options = self.handshake_options().encrypt().session(si);
        let reply: AuthTokenResponse = self.call_on(conn, AUTH_TOKEN, &request, options).await?;

        Ok(SessionState {
            si: si.to_owned(),
            token: Some(token.to_owned()),
            back_id: reply.back_id,
            uid: reply.uid,
            admin: reply.admin,
            machine_id: previous.machine_id.clone(),
        })
    }

    /// Replace the connection unless `observed` is no longer the one in use.
    /// `None` means the request was stale and nothing was done.
    async fn replace_stale(&self, observed: u64) -> Option<Result<()>> {
        let mut slot = self.conn.lock().await;
        let replaced = slot.as_ref().is_some_and(|conn| conn.generation() != observed && !conn.is_closed());
        if replaced {
            return None;
        }
        Some(self.replace(&mut slot).await)
    }

    async fn heartbeat(&self, timeout: Duration) -> Result<()> {
        let conn = self.current().await?;
        let options = CallOptions::new().timeout(timeout);
        let _: Value = self.call_on(&conn, crate::api::user::ACTIVE, &Empty {}, options).await?;
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(conn) = self.conn.get_mut().take() {
            conn.teardown(TransportError::Closed);
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// A reconnect the supervisor has to run: the generation seen failing and
/// why.
type Recovery = (u64, String);

async fn supervise(
    inner: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut retries: mpsc::UnboundedReceiver<u64>,
    shutdown: CancellationToken,
) {
    let mut heartbeat = inner.upgrade().and_then(|inner| inner.config.heartbeat).map(|heartbeat| {
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (ticker, heartbeat.timeout)
    });

    loop {
        let recovery = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => {
                let (Some(event), Some(client)) = (event, inner.upgrade()) else { break };
                client.on_event(event)
            }
            observed = retries.recv() => {
                let Some(observed) = observed else { break };
                Some((observed, "reconnect failed".to_owned()))
            }
            timeout = tick(&mut heartbeat) => {
                let Some(client) = inner.upgrade() else { break };
                match client.heartbeat(timeout).await {
                    Ok(()) => None,
                    Err(Error::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "trim: heartbeat failed");
                        Some((client.current_generation(), "heartbeat".to_owned()))
                    }
                }
            }
        };
        if let Some((observed, cause)) = recovery {
            recover(&inner, &shutdown, observed, &cause).await;
        }
    }
    debug!("trim: supervisor exited");
}

/// Reconnect with backoff until it succeeds, the client closes or every
/// [`Client`] handle is gone.
///
/// Holds a strong reference only while an attempt runs, so dropping the last
/// handle during the backoff ends the loop.
async fn recover(inner: &Weak<ClientInner>, shutdown: &CancellationToken, observed: u64, cause: &str) {
    let mut attempt = 0_u32;
    loop {
        let Some(client) = inner.upgrade() else { return };
        let delay = match client.replace_stale(observed).await {
            None => {
                debug!(observed, "trim: reconnect already done");
                return;
            }
            Some(Ok(())) => {
                info!(cause, attempts = attempt + 1, generation = client.current_generation(), "trim: reconnected");
                return;
            }
            Some(Err(Error::Closed)) => return,
            Some(Err(e)) => {
                attempt = attempt.saturating_add(1);
                let delay = client.config.reconnect_backoff.delay(attempt);
                error!(cause, attempt, error = %e, retry_in = ?delay, "trim: reconnect failed");
                delay
            }
        };
        drop(client);

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn tick(heartbeat: &mut Option<(Interval, Duration)>) -> Duration {
    match heartbeat {
        Some((ticker, timeout)) => {
            ticker.tick().await;
            *timeout
        }
        None => std::future::pending().await,
    }
}

impl ClientInner {
    /// Rebroadcast notifies and decide whether `event` needs a reconnect.
    fn on_event(&self, event: TransportEvent) -> Option<Recovery> {
        let current = self.current_generation();
        match event {
            TransportEvent::Notify { generation, event } => {
                let _ = self.notifications.send(event.clone());
                if generation != current {
                    debug!(generation, current, %event, "trim: notify from stale connection");
                    None
                } else if event.requires_reauth() {
                    info!(%event, "trim: reauthentication requested");
                    Some((generation, event.name().to_owned()))
                } else {
                    if let NotifyEvent::Unrecognized(name) = &event {
                        warn!(%name, "trim: unknown notify");
                    }
                    None
                }
            }
            TransportEvent::Closed { generation, reason } => {
                if generation != current || matches!(reason, TransportError::Closed | TransportError::Superseded) {
                    return None;
                }
                warn!(generation, %reason, "trim: connection lost");
                Some((generation, "connection lost".to_owned()))
            }
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
