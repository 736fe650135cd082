//! `user.*`: login, token resume and session liveness.

use serde::{Deserialize, Serialize};

use crate::api::util::Empty;
use crate::call::CallOptions;
use crate::client::Client;
use crate::error::Result;

pub const LOGIN: &str = "user.login";
pub const AUTH_TOKEN: &str = "user.authToken";
pub const ACTIVE: &str = "user.active";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
    pub device_type: String,
    pub device_name: String,
    pub stay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(deserialize_with = "super::flexible_id::deserialize")]
    pub uid: String,
    pub admin: bool,
    pub token: String,
    /// AES-CBC encrypted HMAC secret, base64.
    pub secret: String,
    pub back_id: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthTokenRequest {
    pub token: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub main: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthTokenResponse {
    #[serde(deserialize_with = "super::flexible_id::deserialize")]
    pub uid: String,
    pub admin: bool,
    pub back_id: String,
}

pub struct UserService<'a> {
    client: &'a Client,
}

impl<'a> UserService<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Password login. The orchestrator sends this encrypted with the
    /// handshake `si`; calling it again does not update the client session.
    ///
    /// # Errors
    ///
    /// Any call failure.
    pub async fn login(&self, request: &LoginRequest, options: CallOptions) -> Result<LoginResponse> {
        self.client.invoke(LOGIN, request, options).await
    }

    /// # Errors
    ///
    /// Any call failure.
    pub async fn auth_token(&self, request: &AuthTokenRequest, options: CallOptions) -> Result<AuthTokenResponse> {
        self.client.invoke(AUTH_TOKEN, request, options).await
    }

    /// Signed liveness probe with an empty body.
    ///
    /// # Errors
    ///
    /// Any call failure.
    pub async fn active(&self, options: CallOptions) -> Result<()> {
        let _: serde_json::Value = self.client.invoke(ACTIVE, &Empty {}, options).await?;
        Ok(())
    }
}
