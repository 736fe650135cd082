//! Wire envelopes and inbound frame codec for the fnOS control-plane websocket.
//!
//! This crate owns the text-frame representation shared by the client
//! transport and the test appliance. It knows nothing about sockets or
//! cryptography: signing and encryption produce the strings that the
//! builders here splice together.
//!
//! WIRE SHAPES
//! ===========
//! Outbound:
//! - plain body: `{"reqid":"<id>","req":"<method>",...payload}`
//! - signed: `<44-char base64 HMAC-SHA256><plain body>`
//! - encrypted: `{"req":"encrypted","iv":"..","rsa":"..","aes":".."}`
//! - keepalive: `{"req":"ping"}`
//!
//! Inbound frames are decoded once into [`Inbound`], checked in the order
//! pong, task info, notify, response.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Routing token used before the server assigns one at login.
pub const DEFAULT_BACK_ID: &str = "0000000000000000";

/// Keepalive request body.
pub const PING: &str = r#"{"req":"ping"}"#;

/// `req` value carried by hybrid-encrypted envelopes.
pub const ENCRYPTED_REQ: &str = "encrypted";

/// Length of the base64 HMAC-SHA256 prefix on signed frames.
pub const SIGNATURE_LEN: usize = 44;

/// Number of request ids that can share one timestamp before the counter
/// would repeat itself.
const IDS_PER_SECOND: u32 = 1 << 16;

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned by the frame builders and [`decode_inbound`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not valid JSON.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    /// A request body or inbound frame was valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotObject,
    /// An inbound object matched none of the known discriminants.
    #[error("frame has no recognizable discriminant")]
    Unrecognized,
    /// A known field carried a value of the wrong JSON type.
    #[error("field `{0}` has an unexpected type")]
    FieldType(&'static str),
    /// A response whose `reqid` parsed but whose `field` did not. Carries the
    /// id so the waiting request can be failed instead of left hanging.
    #[error("response {reqid} has an unexpected `{field}`")]
    MalformedResponse { reqid: String, field: &'static str },
}

// =============================================================================
// REQUEST IDS
// =============================================================================

/// Mints request ids of the form `<8-hex unix-seconds><backID><4-hex counter>`.
///
/// The counter is 16 bits and wraps silently. When more than 65536 ids are
/// minted inside one wall-clock second the embedded timestamp is advanced
/// past the current second, so the `(seconds, counter)` pair never repeats
/// for the generator's lifetime.
#[derive(Debug, Clone)]
pub struct RequestIdGenerator {
    back_id: String,
    counter: u16,
    secs: u64,
    issued_in_secs: u32,
}

impl RequestIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self { back_id: DEFAULT_BACK_ID.to_owned(), counter: 1, secs: 0, issued_in_secs: 0 }
    }

    #[must_use]
    pub fn back_id(&self) -> &str {
        &self.back_id
    }

    pub fn set_back_id(&mut self, back_id: impl Into<String>) {
        self.back_id = back_id.into();
    }

    /// Mint the next id for wall-clock time `now_secs`.
    pub fn next_id(&mut self, now_secs: u64) -> String {
        if now_secs > self.secs {
            self.secs = now_secs;
            self.issued_in_secs = 0;
        }
        if self.issued_in_secs == IDS_PER_SECOND {
            self.secs += 1;
            self.issued_in_secs = 0;
        }

        let id = format_request_id(self.secs, &self.back_id, self.counter);
        self.counter = self.counter.wrapping_add(1);
        self.issued_in_secs += 1;
        id
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Format one request id from its parts.
#[must_use]
pub fn format_request_id(secs: u64, back_id: &str, counter: u16) -> String {
    format!("{secs:08x}{back_id}{counter:04x}")
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Splice the correlation header into a serialized request body.
///
/// `body` must be a JSON object. The result always starts with
/// `{"reqid":"<id>","req":"<method>"` followed by the body's own fields.
///
/// # Errors
///
/// Returns [`CodecError::NotObject`] when `body` is not an object.
pub fn encode_request(reqid: &str, method: &str, body: &Value) -> Result<String, CodecError> {
    let Value::Object(fields) = body else {
        return Err(CodecError::NotObject);
    };

    let mut out = format!(
        "{{\"reqid\":{},\"req\":{}",
        serde_json::to_string(reqid)?,
        serde_json::to_string(method)?
    );
    if fields.is_empty() {
        out.push('}');
        return Ok(out);
    }

    let rendered = serde_json::to_string(body)?;
    out.push(',');
    out.push_str(&rendered[1..]);
    Ok(out)
}

/// Concatenate a base64 signature and the body it signs.
#[must_use]
pub fn signed_frame(signature: &str, body: &str) -> String {
    let mut out = String::with_capacity(signature.len() + body.len());
    out.push_str(signature);
    out.push_str(body);
    out
}

/// Split a signed frame into `(signature, body)`.
///
/// Returns `None` when the text does not carry a signature prefix, which is
/// the case for unsigned and encrypted frames (they start with `{`).
#[must_use]
pub fn split_signed_frame(text: &str) -> Option<(&str, &str)> {
    if text.starts_with('{') || text.len() <= SIGNATURE_LEN || !text.is_char_boundary(SIGNATURE_LEN) {
        return None;
    }
    let (signature, body) = text.split_at(SIGNATURE_LEN);
    body.starts_with('{').then_some((signature, body))
}

/// Hybrid-encrypted request envelope. All fields are base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub req: String,
    pub iv: String,
    pub rsa: String,
    pub aes: String,
}

impl EncryptedEnvelope {
    #[must_use]
    pub fn new(iv: String, rsa: String, aes: String) -> Self {
        Self { req: ENCRYPTED_REQ.to_owned(), iv, rsa, aes }
    }

    /// Render the envelope as a text frame.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// NOTIFY
// =============================================================================

/// Server-pushed event delivered outside the request/response channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    TokenExpired,
    PrivilegeChanged,
    FileFav,
    LiveUpdate,
    /// A name outside the known set. Kept so receivers can log it.
    Unrecognized(String),
}

impl NotifyEvent {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "tokenExpired" => Self::TokenExpired,
            "privilegeChanged" => Self::PrivilegeChanged,
            "fileFav" => Self::FileFav,
            "liveupdate" => Self::LiveUpdate,
            other => Self::Unrecognized(other.to_owned()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::TokenExpired => "tokenExpired",
            Self::PrivilegeChanged => "privilegeChanged",
            Self::FileFav => "fileFav",
            Self::LiveUpdate => "liveupdate",
            Self::Unrecognized(name) => name,
        }
    }

    /// Whether the session must be re-established after this event.
    #[must_use]
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::PrivilegeChanged)
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// REMOTE CODES
// =============================================================================

/// Server `errno` values. `Unrecognized` keeps codes added server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    Unrecognized(i64),
}

impl RemoteCode {
    #[must_use]
    pub fn from_errno(errno: i64) -> Self {
        match errno {
            0 => Self::Ok,
            1 => Self::Canceled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            other => Self::Unrecognized(other),
        }
    }

    #[must_use]
    pub fn errno(self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Canceled => 1,
            Self::Unknown => 2,
            Self::InvalidArgument => 3,
            Self::DeadlineExceeded => 4,
            Self::NotFound => 5,
            Self::AlreadyExists => 6,
            Self::PermissionDenied => 7,
            Self::ResourceExhausted => 8,
            Self::FailedPrecondition => 9,
            Self::Aborted => 10,
            Self::OutOfRange => 11,
            Self::Unimplemented => 12,
            Self::Internal => 13,
            Self::Unavailable => 14,
            Self::DataLoss => 15,
            Self::Unauthenticated => 16,
            Self::Unrecognized(errno) => errno,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::OutOfRange => "OutOfRange",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DataLoss => "DataLoss",
            Self::Unauthenticated => "Unauthenticated",
            Self::Unrecognized(_) => "Unrecognized",
        }
    }
}

impl fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized(errno) => write!(f, "Code({errno})"),
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// A correlated response. `body` is the whole decoded frame, which is what
/// callers deserialize their reply type from.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub reqid: String,
    pub result: Option<String>,
    pub code: RemoteCode,
    pub body: Value,
}

impl Response {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == RemoteCode::Ok
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Pong,
    TaskInfo(String),
    Notify(NotifyEvent),
    Response(Response),
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed text, [`CodecError::NotObject`]
/// for non-object JSON and [`CodecError::Unrecognized`] when no discriminant
/// matches. A response with a usable `reqid` but a non-integer `errno` is
/// [`CodecError::MalformedResponse`].
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(fields) = &value else {
        return Err(CodecError::NotObject);
    };

    if str_field(fields, "res") == Some("pong") {
        return Ok(Inbound::Pong);
    }
    if let Some(task) = non_empty(fields, "taskInfo") {
        return Ok(Inbound::TaskInfo(task.to_owned()));
    }
    for key in ["notify", "deviceNotify", "sysNotify"] {
        if let Some(name) = non_empty(fields, key) {
            return Ok(Inbound::Notify(NotifyEvent::from_name(name)));
        }
    }

    let reqid = match fields.get("reqid") {
        Some(Value::String(reqid)) => reqid.clone(),
        Some(_) => return Err(CodecError::FieldType("reqid")),
        None => return Err(CodecError::Unrecognized),
    };
    let errno = match fields.get("errno") {
        None | Some(Value::Null) => 0,
        Some(value) => match value.as_i64() {
            Some(errno) => errno,
            None => return Err(CodecError::MalformedResponse { reqid, field: "errno" }),
        },
    };
    let result = str_field(fields, "result").map(ToOwned::to_owned);

    Ok(Inbound::Response(Response { reqid, result, code: RemoteCode::from_errno(errno), body: value }))
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn non_empty<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    str_field(fields, key).filter(|value| !value.is_empty())
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
