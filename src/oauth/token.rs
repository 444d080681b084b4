//! OAuth token records
//!
//! A [`TokenRecord`] is the single source of truth for "am I authenticated".
//! Its expiry is always absolute; a relative `expires_in` is resolved when the
//! record is built.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest lifetime a token record is given; larger `expires_in` values are clamped
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Persisted OAuth token record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Refresh token (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scopes, space separated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Absolute expiry instant
    pub expires_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Token endpoint success response (RFC 6749 §5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenRecord {
    /// Build a record from a token response received at `now`
    ///
    /// `previous` supplies the refresh token and scope when a refresh response
    /// omits them. `requested_scope` stands in for an omitted scope on first
    /// issue, since the server then granted what was asked for.
    #[must_use]
    pub fn from_response(
        response: TokenResponse,
        previous: Option<&TokenRecord>,
        requested_scope: Option<&str>,
        default_lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let lifetime = response
            .expires_in
            .map_or(default_lifetime, Duration::from_secs)
            .min(MAX_TOKEN_LIFETIME);
        let expires_at = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let refresh_token = response
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));
        let scope = response
            .scope
            .or_else(|| previous.and_then(|p| p.scope.clone()))
            .or_else(|| requested_scope.map(str::to_string));

        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            refresh_token,
            scope,
            expires_at,
        }
    }

    /// Check if the token is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if the token is expired now
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time until expiration, zero once expired
    #[must_use]
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// True when the remaining lifetime is below `threshold`
    #[must_use]
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.time_until_expiry(now) < threshold
    }

    /// Granted scopes as a list
    #[must_use]
    pub fn granted_scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// True when every required scope is granted
    ///
    /// A record without a scope covers nothing, so it only passes when no scope
    /// is required.
    #[must_use]
    pub fn covers_scopes(&self, required: &[String]) -> bool {
        let granted = self.granted_scopes();
        required.iter().all(|r| scope_is_covered(r, &granted))
    }
}

/// True when `required` is granted exactly or by a `prefix:*` wildcard
#[must_use]
pub fn scope_is_covered(required: &str, granted: &[&str]) -> bool {
    granted.iter().any(|g| {
        if *g == required {
            return true;
        }
        g.strip_suffix(":*").is_some_and(|prefix| {
            required
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|action| !action.is_empty())
        })
    })
}

/// Delay before a proactive refresh: `max(0, expires_at - threshold - now)`
#[must_use]
pub fn refresh_delay(record: &TokenRecord, threshold: Duration, now: DateTime<Utc>) -> Duration {
    record
        .time_until_expiry(now)
        .saturating_sub(threshold)
}
