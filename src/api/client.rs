//! Outbound HTTP client shared by the token and conversion calls
//!
//! One `reqwest::Client` per process: connection pooling across both
//! endpoints, a hard per-request timeout, and optional CA pinning.

use anyhow::{Context, Result};

use crate::config::HttpConfig;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the client described by `config`.
///
/// With `pinned_ca_pem` set, the built-in root store is switched off and
/// only that certificate can anchor a TLS chain.
pub fn build_http_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout())
        .connect_timeout(config.timeout())
        .user_agent(USER_AGENT);

    if let Some(path) = &config.pinned_ca_pem {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read pinned CA {}", path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("Invalid PEM in pinned CA {}", path.display()))?;

        tracing::info!("TLS pinned to CA {}", path.display());
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(cert);
    }

    builder.build().context("Failed to build HTTP client")
}

/// Split a response into (status, body) so callers can report both.
pub async fn read_response(
    resp: reqwest::Response,
) -> Result<(reqwest::StatusCode, String), reqwest::Error> {
    let status = resp.status();
    let body = resp.text().await?;
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_client_builds() {
        tokio_test::assert_ok!(build_http_client(&HttpConfig::default()));
    }

    #[test]
    fn test_missing_pinned_ca_fails() {
        let config = HttpConfig {
            pinned_ca_pem: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..HttpConfig::default()
        };
        let err = build_http_client(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read pinned CA"));
    }
}
