//! `appcgi.netsvr.cert.*`: TLS certificates served by the appliance's
//! remote-access endpoint.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::call::CallOptions;
use crate::client::Client;
use crate::error::Result;

pub const UPLOAD_CERT: &str = "appcgi.netsvr.cert.upload";
pub const REPLACE_CERT: &str = "appcgi.netsvr.cert.replace";
pub const GET_CERT_LIST: &str = "appcgi.netsvr.cert.list";

/// A certificate installed on the appliance. Timestamps are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cert {
    pub id: i64,
    pub domain: String,
    pub encrypt_type: String,
    pub issued_by: String,
    #[serde(rename = "SAN")]
    pub san: String,
    pub status: String,
    pub valid_from: i64,
    pub valid_to: i64,
    pub desc: String,
    pub is_default: i64,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GetCertListResponse {
    pub data: Vec<Cert>,
}

impl GetCertListResponse {
    /// First certificate issued for `domain`.
    #[must_use]
    pub fn find_domain(&self, domain: &str) -> Option<&Cert> {
        self.data.iter().find(|cert| cert.domain == domain)
    }
}

/// Key material for upload or replace. PEM files are sent base64-encoded
/// as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CertRequestData {
    pub id: i64,
    pub desc: String,
    pub private_key_base64: String,
    pub certificate_base64: String,
    pub issuer_certificate_base64: String,
    pub is_default: i64,
}

impl CertRequestData {
    #[must_use]
    pub fn from_pem_bundle(desc: impl Into<String>, key_pem: &[u8], cert_pem: &[u8]) -> Self {
        Self {
            desc: desc.into(),
            private_key_base64: STANDARD.encode(key_pem),
            certificate_base64: STANDARD.encode(cert_pem),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer_pem: &[u8]) -> Self {
        self.issuer_certificate_base64 = STANDARD.encode(issuer_pem);
        self
    }

    /// Target an installed certificate for replacement.
    #[must_use]
    pub fn for_cert(mut self, id: i64) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertRequest {
    pub data: CertRequestData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CertMutationResponse {
    pub data: bool,
}

pub struct RemoteAccessService<'a> {
    client: &'a Client,
}

impl<'a> RemoteAccessService<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// # Errors
    ///
    /// Any call failure.
    pub async fn get_cert_list(&self, options: CallOptions) -> Result<GetCertListResponse> {
        self.client.invoke(GET_CERT_LIST, &crate::api::util::Empty {}, options).await
    }

    /// Returns the server's `data` flag.
    ///
    /// # Errors
    ///
    /// Any call failure.
    pub async fn upload_cert(&self, data: CertRequestData, options: CallOptions) -> Result<bool> {
        let reply: CertMutationResponse = self.client.invoke(UPLOAD_CERT, &CertRequest { data }, options).await?;
        Ok(reply.data)
    }

    /// Returns the server's `data` flag.
    ///
    /// # Errors
    ///
    /// Any call failure.
    pub async fn replace_cert(&self, data: CertRequestData, options: CallOptions) -> Result<bool> {
        let reply: CertMutationResponse = self.client.invoke(REPLACE_CERT, &CertRequest { data }, options).await?;
        Ok(reply.data)
    }
}
