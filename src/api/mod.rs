//! Typed wrappers for the appliance method namespaces.
//!
//! Each service borrows the [`Client`](crate::Client) and forwards to
//! [`Client::invoke`](crate::Client::invoke) with the method-name constant
//! and request/response types defined next to it.

pub mod remoteaccess;
pub mod user;
pub mod util;

pub use remoteaccess::RemoteAccessService;
pub use user::UserService;
pub use util::UtilService;

/// Accept an id the server sends either as a JSON number or a string.
pub(crate) mod flexible_id {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(id) => id,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
