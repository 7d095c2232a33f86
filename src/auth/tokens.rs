//! Access token model

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Longest lifetime a token is scheduled for. Issuer TTLs above this are
/// treated as malformed by the endpoint decoder and clamped here.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// A token as handed back by the token endpoint, before scheduling.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub value: String,
    /// Lifetime declared by the issuer.
    pub ttl: Duration,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("value", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// The current bearer credential. Immutable once built; a refresh swaps
/// in a new one.
#[derive(Clone)]
pub struct AccessToken {
    value: String,
    pub issued_at: DateTime<Utc>,
    /// Issuer TTL minus the safety margin. The token is renewed at this point.
    pub expires_at: DateTime<Utc>,
    refresh_at: Instant,
}

impl AccessToken {
    /// Stamp an issued token with its effective lifetime.
    ///
    /// A TTL no longer than `safety_margin` would expire on arrival, so
    /// such tokens are renewed at half their TTL instead.
    pub fn from_issued(issued: IssuedToken, safety_margin: Duration) -> Self {
        let lifetime = effective_lifetime(issued.ttl.min(MAX_TOKEN_TTL), safety_margin);
        let now = Instant::now();
        let refresh_at = now.checked_add(lifetime).unwrap_or(now);

        let issued_at = Utc::now();
        let expires_at = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| issued_at.checked_add_signed(d))
            .unwrap_or(issued_at);

        Self {
            value: issued.value,
            issued_at,
            expires_at,
            refresh_at,
        }
    }

    /// The bearer string.
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// Monotonic deadline for the proactive renewal.
    pub fn refresh_at(&self) -> Instant {
        self.refresh_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.refresh_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn effective_lifetime(ttl: Duration, safety_margin: Duration) -> Duration {
    if ttl > safety_margin {
        ttl - safety_margin
    } else {
        ttl / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued(secs: u64) -> IssuedToken {
        IssuedToken {
            value: "tok".to_string(),
            ttl: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_margin_is_subtracted() {
        let token = AccessToken::from_issued(issued(7200), Duration::from_secs(300));
        let lifetime = token.expires_at - token.issued_at;
        assert_eq!(lifetime.num_seconds(), 6900);
        assert!(!token.is_expired());
        assert_eq!(token.secret(), "tok");
    }

    #[test]
    fn test_short_ttl_renews_at_half() {
        assert_eq!(
            effective_lifetime(Duration::from_secs(200), Duration::from_secs(300)),
            Duration::from_secs(100)
        );
        assert_eq!(
            effective_lifetime(Duration::from_secs(300), Duration::from_secs(300)),
            Duration::from_secs(150)
        );
    }

    #[test]
    fn test_zero_margin_keeps_ttl() {
        assert_eq!(
            effective_lifetime(Duration::from_secs(60), Duration::ZERO),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_oversized_ttl_is_clamped() {
        let token = AccessToken::from_issued(issued(u64::MAX), Duration::from_secs(300));
        let lifetime = (token.expires_at - token.issued_at).to_std().unwrap();
        assert_eq!(lifetime, MAX_TOKEN_TTL - Duration::from_secs(300));
        assert!(!token.is_expired());
    }

    #[test]
    fn test_debug_hides_value() {
        let token = AccessToken::from_issued(issued(60), Duration::ZERO);
        let out = format!("{:?} {:?}", token, issued(60));
        assert!(!out.contains("tok\""));
        assert!(out.contains("<redacted>"));
    }
}
