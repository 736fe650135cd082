//! Error taxonomy for the control-plane client.
//!
//! DESIGN
//! ======
//! Errors split by blast radius:
//! - connection-fatal: [`TransportError`] and [`Error::Timeout`] tear the
//!   connection down and fail every call still in flight on it.
//! - call-local: remote errno, crypto, encode/decode and cancellation only
//!   reach the invoking caller and never trigger a reconnect.

use std::time::Duration;

use frames::RemoteCode;
use tokio_tungstenite::tungstenite;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Failures of the websocket connection itself.
///
/// Cloneable so one teardown reason can be handed to every request still
/// registered on the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid appliance address: {0}")]
    InvalidAddress(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("websocket write failed: {0}")]
    Write(String),
    #[error("websocket read failed: {0}")]
    Read(String),
    #[error("websocket closed by peer")]
    PeerClosed,
    #[error("connection closed")]
    Closed,
    #[error("connection replaced by reconnect")]
    Superseded,
    #[error("server pong not received within {0:?}")]
    PongTimeout(Duration),
}

impl TransportError {
    pub(crate) fn connect(error: &tungstenite::Error) -> Self {
        Self::Connect(error.to_string())
    }

    pub(crate) fn write(error: &tungstenite::Error) -> Self {
        Self::Write(error.to_string())
    }

    pub(crate) fn read(error: &tungstenite::Error) -> Self {
        Self::Read(error.to_string())
    }
}

// =============================================================================
// CRYPTO
// =============================================================================

/// Failures of the session credential.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to decode PEM block containing public key")]
    InvalidPem,
    #[error("not an RSA public key")]
    NotRsa,
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("server public key not set")]
    MissingPublicKey,
    #[error("rsa encryption failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decrypted secret too short: {0} bytes")]
    SecretTooShort(usize),
}

// =============================================================================
// CLIENT ERROR
// =============================================================================

/// Error returned by every public client operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame that could not be built or understood.
    #[error("protocol error: {0}")]
    Protocol(#[from] frames::CodecError),

    /// The server answered with a non-zero errno.
    #[error("rpc error: method = {method} code = {code}")]
    Remote { method: String, code: RemoteCode },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Keepalive pong missed; the connection was torn down.
    #[error("keepalive timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired or its deadline elapsed.
    #[error("call to {method} cancelled")]
    Cancelled { method: String },

    #[error("request encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("response decode failed for {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// A signed call was attempted before login stored the shared secret.
    #[error("shared secret not established; use an encrypted or unsigned call")]
    MissingSecret,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The client was shut down.
    #[error("client closed")]
    Closed,
}

impl Error {
    /// Whether the error came from the connection rather than the single call.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// The remote errno, when the server rejected the call.
    #[must_use]
    pub fn remote_code(&self) -> Option<RemoteCode> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Map a connection teardown reason to the error its callers observe.
    pub(crate) fn from_teardown(reason: TransportError) -> Self {
        match reason {
            TransportError::PongTimeout(after) => Self::Timeout(after),
            other => Self::Transport(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
