//! Session-secured websocket RPC client for the fnOS (trim) control plane.
//!
//! ```no_run
//! # async fn run() -> trim_rpc::Result<()> {
//! let config = trim_rpc::ClientConfig::from_env()?;
//! let client = trim_rpc::Client::connect(config).await?;
//! let certs = client.remote_access().get_cert_list(trim_rpc::CallOptions::new()).await?;
//! for cert in &certs.data {
//!     println!("{} valid until {}", cert.domain, cert.valid_to);
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod call;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use call::{CallOptions, SecurityMode};
pub use client::{Client, ClientState, SessionState};
pub use config::ClientConfig;
pub use credentials::KeyRotation;
pub use error::{CryptoError, Error, Result, TransportError};
pub use frames::{NotifyEvent, RemoteCode};
