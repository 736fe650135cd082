//! Call layer: one write and one correlated read per invocation.
//!
//! DESIGN
//! ======
//! Options resolve to exactly one [`SecurityMode`], in precedence order
//! `encrypt` > `skip_sign` > signed. `session(si)` injects `si` into the
//! payload in every mode.
//!
//! A caller deadline or cancellation token withdraws the pending entry and
//! returns [`Error::Cancelled`], unless the response was already delivered,
//! in which case the response is returned. The deadline covers the write as
//! well as the wait, and a token that already fired sends nothing.

use std::time::Duration;

use frames::Response;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::transport::{Connection, PendingRequest};

// =============================================================================
// OPTIONS
// =============================================================================

/// How one request is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Hybrid RSA/AES envelope; used before the secret exists.
    Encrypted,
    /// Raw JSON; only for the first, pre-key call.
    Unsigned,
    /// HMAC-signed JSON.
    Signed,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    encrypt: bool,
    skip_sign: bool,
    si: Option<String>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl CallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn encrypt(mut self) -> Self {
        self.encrypt = true;
        self
    }

    #[must_use]
    pub fn skip_sign(mut self) -> Self {
        self.skip_sign = true;
        self
    }

    /// Attach the handshake session id as the `si` field.
    #[must_use]
    pub fn session(mut self, si: impl Into<String>) -> Self {
        self.si = Some(si.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn security_mode(&self) -> SecurityMode {
        if self.encrypt {
            SecurityMode::Encrypted
        } else if self.skip_sign {
            SecurityMode::Unsigned
        } else {
            SecurityMode::Signed
        }
    }

    #[must_use]
    pub fn si(&self) -> Option<&str> {
        self.si.as_deref()
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Serialize `request` to a JSON object, injecting `si` when given.
///
/// # Errors
///
/// [`Error::Encode`] when serialization fails, [`Error::Protocol`] when the
/// request is not an object.
pub fn request_body<Req: Serialize + ?Sized>(request: &Req, si: Option<&str>) -> Result<Value> {
    let mut body = serde_json::to_value(request).map_err(Error::Encode)?;
    let Value::Object(fields) = &mut body else {
        return Err(frames::CodecError::NotObject.into());
    };
    if let Some(si) = si {
        fields.insert("si".to_owned(), Value::String(si.to_owned()));
    }
    Ok(body)
}

/// Render the text frame for one call.
///
/// # Errors
///
/// Propagates frame encoding and credential failures.
pub fn encode_frame(
    credential: &Credential,
    reqid: &str,
    method: &str,
    body: &Value,
    mode: SecurityMode,
) -> Result<String> {
    let plain = frames::encode_request(reqid, method, body)?;
    match mode {
        SecurityMode::Encrypted => credential.encrypted_request(&plain),
        SecurityMode::Unsigned => Ok(plain),
        SecurityMode::Signed => credential.sign(&plain),
    }
}

// =============================================================================
// INVOKE
// =============================================================================

/// Issue `method` on `conn` and wait for its response.
///
/// # Errors
///
/// [`Error::Remote`] for a non-zero errno, [`Error::Cancelled`] when the
/// deadline or token fires first, transport errors when the connection dies.
pub async fn invoke(
    conn: &Connection,
    credential: &Credential,
    method: &str,
    body: Value,
    options: &CallOptions,
) -> Result<Response> {
    let mode = options.security_mode();
    let body = match options.si() {
        Some(si) => request_body(&body, Some(si))?,
        None => body,
    };

    let deadline = options.timeout.map(|after| Instant::now() + after);
    let cancel = options.cancel.as_ref();
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        debug!(%method, "trim: call cancelled before send");
        return Err(Error::Cancelled { method: method.to_owned() });
    }

    let reqid = conn.next_request_id();
    let frame = encode_frame(credential, &reqid, method, &body, mode)?;

    // Dropping `pending` on an early return deregisters it.
    let pending = conn.register(reqid).map_err(Error::from_teardown)?;
    let sent = tokio::select! {
        biased;
        sent = conn.send_text(frame) => Some(sent),
        () = expired(deadline) => None,
        () = cancelled(cancel) => None,
    };
    match sent {
        Some(sent) => sent.map_err(Error::from_teardown)?,
        None => {
            debug!(%method, "trim: call withdrawn before send completed");
            return Err(Error::Cancelled { method: method.to_owned() });
        }
    }
    debug!(%method, reqid = %pending.reqid(), ?mode, "trim: call sent");

    let response = wait(pending, deadline, cancel, method).await?;
    if !response.is_success() {
        debug!(%method, code = %response.code, "trim: call rejected");
        return Err(Error::Remote { method: method.to_owned(), code: response.code });
    }
    Ok(response)
}

/// Deserialize a successful response body into `Resp`.
pub(crate) fn decode<Resp: DeserializeOwned>(method: &str, response: Response) -> Result<Resp> {
    serde_json::from_value(response.body).map_err(|source| Error::Decode { method: method.to_owned(), source })
}

enum Wake {
    Resolved(Result<Response>),
    Withdrawn,
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait(
    mut pending: PendingRequest<'_>,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
    method: &str,
) -> Result<Response> {
    let wake = tokio::select! {
        biased;
        outcome = pending.wait() => Wake::Resolved(outcome),
        () = expired(deadline) => Wake::Withdrawn,
        () = cancelled(cancel) => Wake::Withdrawn,
    };

    match wake {
        Wake::Resolved(outcome) => outcome,
        Wake::Withdrawn => match pending.abandon() {
            Some(outcome) => outcome,
            None => {
                debug!(%method, "trim: call withdrawn");
                Err(Error::Cancelled { method: method.to_owned() })
            }
        },
    }
}

#[cfg(test)]
#[path = "call_test.rs"]
mod tests;
