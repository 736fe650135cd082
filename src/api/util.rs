//! `util.*`: handshake helpers.

use serde::{Deserialize, Serialize};

use crate::call::CallOptions;
use crate::client::Client;
use crate::error::Result;

pub const GET_RSA_PUB: &str = "util.crypto.getRSAPub";
pub const GET_SI: &str = "util.getSI";

#[derive(Debug, Clone, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GetRsaPubResponse {
    /// PEM `PUBLIC KEY` block.
    #[serde(rename = "pub")]
    pub public_key: String,
    pub si: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GetSiResponse {
    pub si: String,
}

pub struct UtilService<'a> {
    client: &'a Client,
}

impl<'a> UtilService<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Fetch the server's RSA key and a fresh session id. Normally sent
    /// with [`CallOptions::skip_sign`].
    ///
    /// # Errors
    ///
    /// Any call failure.
    pub async fn get_rsa_pub(&self, options: CallOptions) -> Result<GetRsaPubResponse> {
        self.client.invoke(GET_RSA_PUB, &Empty {}, options).await
    }

    /// # Errors
    ///
    /// Any call failure.
    pub async fn get_si(&self, options: CallOptions) -> Result<GetSiResponse> {
        self.client.invoke(GET_SI, &Empty {}, options).await
    }
}
