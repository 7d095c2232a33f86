//! Access token lifecycle for the ad-analytics platform
//!
//! Exchanges app credentials for a bearer token, keeps it fresh on a
//! background task ahead of expiry, and hands the current token to readers
//! without ever blocking them on network I/O.

pub mod backoff;
pub mod endpoint;
pub mod manager;
pub mod tokens;

pub use endpoint::{HttpTokenSource, TokenSource};
pub use manager::{RefreshEvent, RefreshPolicy, TokenHandle, TokenManager, TokenState};
pub use tokens::{AccessToken, IssuedToken};

/// Token acquisition failures.
///
/// Everything except `InvalidConfig`, `AlreadyStarted` and `Shutdown` is
/// transient: the manager retries it with backoff instead of surfacing it.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token configuration: {0}")]
    InvalidConfig(String),

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token endpoint refused the request (err_no {code}): {tips}")]
    Rejected { code: i64, tips: String },

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("token manager already started")]
    AlreadyStarted,

    #[error("token manager is shutting down")]
    Shutdown,
}
