//! Conversion reporting to the ad-analytics platform
//!
//! One POST per event carrying the credited click as the ad callback:
//!
//! ```text
//! {"event_type": "active", "context": {"ad": {"callback": "<clickId>"}}, "timestamp": 1700000000}
//! ```
//!
//! No retries here. Re-sending a conversion is not idempotent upstream, so
//! the caller decides whether a failed report is dropped.

use std::time::Duration;

use serde::Serialize;

use super::client::read_response;
use crate::auth::{AccessToken, TokenHandle};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("no access token available yet")]
    NoToken,

    #[error("conversion request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("conversion endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Serialize)]
struct ConversionPayload<'a> {
    event_type: &'a str,
    context: ConversionContext<'a>,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct ConversionContext<'a> {
    ad: AdInfo<'a>,
}

#[derive(Debug, Serialize)]
struct AdInfo<'a> {
    callback: &'a str,
}

/// Sends conversion events authenticated with the managed access token.
pub struct ConversionReporter {
    http: reqwest::Client,
    endpoint: String,
    tokens: TokenHandle,
    token_wait: Duration,
}

impl ConversionReporter {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, tokens: TokenHandle) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            tokens,
            token_wait: Duration::ZERO,
        }
    }

    /// Let a report issued before the first token arrives wait up to `wait` for it.
    pub fn with_token_wait(mut self, wait: Duration) -> Self {
        self.token_wait = wait;
        self
    }

    fn build_request(
        &self,
        token: &AccessToken,
        event_type: &str,
        click_id: &str,
    ) -> Result<reqwest::Request, ReportError> {
        let payload = ConversionPayload {
            event_type,
            context: ConversionContext {
                ad: AdInfo { callback: click_id },
            },
            timestamp: chrono::Utc::now().timestamp(),
        };

        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token.secret())
            .json(&payload)
            .build()?;
        Ok(request)
    }

    /// Report `event_type` for the install credited to `click_id`.
    /// Returns the platform's response body.
    pub async fn report_conversion(
        &self,
        event_type: &str,
        click_id: &str,
    ) -> Result<String, ReportError> {
        let token = self
            .tokens
            .wait_current(self.token_wait)
            .await
            .ok_or(ReportError::NoToken)?;
        let request = self.build_request(&token, event_type, click_id)?;
        tracing::debug!("Conversion POST {} ({})", self.endpoint, event_type);

        let resp = self.http.execute(request).await?;
        let (status, body) = read_response(resp).await?;
        if !status.is_success() {
            return Err(ReportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{IssuedToken, RefreshPolicy, TokenError, TokenManager, TokenSource};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const ENDPOINT: &str = "http://analytics.example.test/api/v2/conversion";

    struct FixedSource;

    #[async_trait]
    impl TokenSource for FixedSource {
        async fn fetch(&self) -> Result<IssuedToken, TokenError> {
            Ok(IssuedToken {
                value: "bearer-123".to_string(),
                ttl: Duration::from_secs(7200),
            })
        }
    }

    async fn started_manager() -> TokenManager {
        let manager = TokenManager::new(Arc::new(FixedSource), RefreshPolicy::default());
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_request_carries_token_and_payload() {
        let manager = started_manager().await;
        let reporter = ConversionReporter::new(reqwest::Client::new(), ENDPOINT, manager.handle());

        let token = manager.current_token().unwrap();
        let request = reporter.build_request(&token, "active", "c100").unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), ENDPOINT);
        assert_eq!(
            request.headers()[reqwest::header::AUTHORIZATION],
            "Bearer bearer-123"
        );
        assert_eq!(
            request.headers()[reqwest::header::CONTENT_TYPE],
            "application/json"
        );

        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["event_type"], "active");
        assert_eq!(json["context"]["ad"]["callback"], "c100");
        assert!(json["timestamp"].as_i64().unwrap() > 1_600_000_000);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_token_before_start() {
        let manager = TokenManager::new(Arc::new(FixedSource), RefreshPolicy::default());
        let reporter = ConversionReporter::new(reqwest::Client::new(), ENDPOINT, manager.handle());

        assert!(matches!(
            reporter.report_conversion("active", "c100").await,
            Err(ReportError::NoToken)
        ));
    }

    #[tokio::test]
    async fn test_report_waits_for_first_token() {
        let manager = Arc::new(TokenManager::new(Arc::new(FixedSource), RefreshPolicy::default()));
        let reporter = ConversionReporter::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/conversion",
            manager.handle(),
        )
        .with_token_wait(Duration::from_secs(5));

        let report = tokio::spawn(async move { reporter.report_conversion("active", "c100").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.start().await.unwrap();

        // Got past the token check and reached the (refused) endpoint.
        assert!(matches!(
            report.await.unwrap(),
            Err(ReportError::Transport(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let manager = started_manager().await;
        // Port 9 on localhost: nothing listens, connection is refused.
        let reporter = ConversionReporter::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/conversion",
            manager.handle(),
        );

        assert!(matches!(
            reporter.report_conversion("active", "c100").await,
            Err(ReportError::Transport(_))
        ));
        manager.shutdown().await;
    }
}
