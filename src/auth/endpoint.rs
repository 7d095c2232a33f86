//! Client-credential exchange against the platform token endpoint
//!
//! `POST {appid, secret, grant_type: "client_credential"}` and expect
//! `{err_no, err_tips, data: {access_token, expires_in}}`. A non-zero
//! `err_no` is a logical failure even on HTTP 200.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::tokens::{IssuedToken, MAX_TOKEN_TTL};
use super::TokenError;
use crate::api::client::read_response;
use crate::config::TokenConfig;

const GRANT_TYPE: &str = "client_credential";

/// Anything that can mint a fresh access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<IssuedToken, TokenError>;
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    appid: &'a str,
    secret: &'a str,
    grant_type: &'a str,
}

/// Response from the token endpoint
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub err_no: i64,
    #[serde(default)]
    pub err_tips: String,
    pub data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
pub struct TokenData {
    #[serde(default)]
    pub access_token: String,
    /// Seconds.
    #[serde(default)]
    pub expires_in: u64,
}

impl TokenResponse {
    /// Turn a decoded body into a token, rejecting logical failures.
    pub fn into_token(self) -> Result<IssuedToken, TokenError> {
        if self.err_no != 0 {
            return Err(TokenError::Rejected {
                code: self.err_no,
                tips: self.err_tips,
            });
        }

        let data = self
            .data
            .ok_or_else(|| TokenError::Malformed("response missing 'data'".to_string()))?;
        if data.access_token.is_empty() {
            return Err(TokenError::Malformed(
                "response missing 'access_token'".to_string(),
            ));
        }
        if data.expires_in == 0 {
            return Err(TokenError::Malformed(
                "response has zero 'expires_in'".to_string(),
            ));
        }
        if data.expires_in > MAX_TOKEN_TTL.as_secs() {
            return Err(TokenError::Malformed(format!(
                "response 'expires_in' of {}s is out of range",
                data.expires_in
            )));
        }

        Ok(IssuedToken {
            value: data.access_token,
            ttl: Duration::from_secs(data.expires_in),
        })
    }
}

/// Token source backed by the HTTP token endpoint.
pub struct HttpTokenSource {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    app_id: String,
    app_secret: String,
}

impl HttpTokenSource {
    /// Validate credentials and endpoint up front; these are the only
    /// failures that can never be cured by retrying.
    pub fn new(http: reqwest::Client, config: &TokenConfig) -> Result<Self, TokenError> {
        if config.app_id.trim().is_empty() {
            return Err(TokenError::InvalidConfig("app_id is empty".to_string()));
        }
        if config.app_secret.is_empty() {
            return Err(TokenError::InvalidConfig("app_secret is empty".to_string()));
        }
        let endpoint = reqwest::Url::parse(&config.endpoint).map_err(|e| {
            TokenError::InvalidConfig(format!("token endpoint {:?}: {}", config.endpoint, e))
        })?;

        Ok(Self {
            http,
            endpoint,
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
        })
    }

    fn request_body(&self) -> TokenRequest<'_> {
        TokenRequest {
            appid: &self.app_id,
            secret: &self.app_secret,
            grant_type: GRANT_TYPE,
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<IssuedToken, TokenError> {
        tracing::debug!("Requesting access token from {}", self.endpoint);

        let resp = self
            .http
            .post(self.endpoint.clone())
            .json(&self.request_body())
            .send()
            .await?;

        let (status, body) = read_response(resp).await?;
        if !status.is_success() {
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| TokenError::Malformed(format!("undecodable token response: {}", e)))?;
        parsed.into_token()
    }
}
