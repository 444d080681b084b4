//! Error types for the OAuth session layer

use std::fmt;

use thiserror::Error;

use crate::oauth::OAuthErrorCode;

/// Result type alias for remote-oauth
pub type Result<T> = std::result::Result<T, Error>;

/// remote-oauth errors
///
/// Every payload is an owned string so that one outcome can be handed to all
/// waiters of a shared refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Deployment URL could not be parsed
    #[error("Invalid deployment: {0}")]
    InvalidDeployment(String),

    /// Authorization server metadata is malformed or lacks a required capability
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Dynamic client registration unavailable or rejected
    #[error("Registration error: {0}")]
    Registration(String),

    /// The authorization-code flow ended without a code
    #[error("Authorization error: {0}")]
    Authorization(AuthorizationFailure),

    /// The token endpoint rejected an authorization code
    #[error("Token exchange error: {0}")]
    TokenExchange(String),

    /// A refresh attempt failed
    #[error("Refresh error ({kind}): {message}")]
    Refresh {
        /// Classification of the failure
        kind: RefreshFailure,
        /// Human readable detail
        message: String,
    },

    /// Token revocation failed (never fatal)
    #[error("Revocation error: {0}")]
    Revocation(String),

    /// Credential store failure
    #[error("Credential store error: {0}")]
    Store(String),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Operation aborted because the owner was disposed or replaced it
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why an authorization-code flow did not produce a code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationFailure {
    /// The flow was cancelled by its owner
    Cancelled,
    /// No callback arrived before the deadline
    TimedOut,
    /// The callback carried a different `state` (possible CSRF)
    StateMismatch,
    /// A newer flow replaced this one
    Superseded,
    /// The authorization server reported an error
    Denied {
        /// `error` query parameter
        error: String,
        /// `error_description` query parameter, if any
        description: Option<String>,
    },
    /// The callback matched but did not contain a code
    MissingCode,
}

impl fmt::Display for AuthorizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("authorization cancelled"),
            Self::TimedOut => f.write_str("timed out waiting for authorization callback"),
            Self::StateMismatch => f.write_str("state mismatch - possible CSRF attack"),
            Self::Superseded => f.write_str("a new authorization flow was started"),
            Self::Denied { error, description } => match description {
                Some(d) => write!(f, "{error} - {d}"),
                None => f.write_str(error),
            },
            Self::MissingCode => f.write_str("authorization code not provided"),
        }
    }
}

/// Classification of a failed refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The stored grant can never succeed again; a fresh login is needed
    ReauthRequired(OAuthErrorCode),
    /// Network trouble, 5xx, `server_error` or `temporarily_unavailable`
    Transient,
    /// The server refused the request for a reason a retry will not fix;
    /// the stored credentials are kept
    Rejected(OAuthErrorCode),
    /// The previous attempt started inside the throttle window
    Throttled,
    /// There is no refresh token to use
    NoCredentials,
    /// The attempt was aborted
    Cancelled,
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReauthRequired(code) => write!(f, "re-authentication required: {code}"),
            Self::Transient => f.write_str("transient"),
            Self::Rejected(code) => write!(f, "rejected: {code}"),
            Self::Throttled => f.write_str("throttled"),
            Self::NoCredentials => f.write_str("no credentials"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl Error {
    /// Create a refresh error
    pub fn refresh(kind: RefreshFailure, message: impl Into<String>) -> Self {
        Self::Refresh {
            kind,
            message: message.into(),
        }
    }

    /// True when the stored credentials must be discarded and the user must log in again
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::Refresh {
                kind: RefreshFailure::ReauthRequired(_),
                ..
            }
        )
    }

    /// True for failures a background retry may recover from
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Store(_)
                | Self::Refresh {
                    kind: RefreshFailure::Transient,
                    ..
                }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reauth_classification() {
        let err = Error::refresh(
            RefreshFailure::ReauthRequired(OAuthErrorCode::InvalidGrant),
            "refresh token revoked",
        );
        assert!(err.requires_reauthentication());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        assert!(Error::refresh(RefreshFailure::Transient, "503").is_transient());
        assert!(Error::Http("connection reset".into()).is_transient());
        assert!(!Error::refresh(RefreshFailure::Throttled, "").is_transient());
        let rejected = Error::refresh(RefreshFailure::Rejected(OAuthErrorCode::InvalidScope), "");
        assert!(!rejected.is_transient());
        assert!(!rejected.requires_reauthentication());
    }

    #[test]
    fn authorization_failure_display() {
        let denied = AuthorizationFailure::Denied {
            error: "access_denied".into(),
            description: Some("user said no".into()),
        };
        assert_eq!(denied.to_string(), "access_denied - user said no");
        assert_eq!(
            Error::Authorization(AuthorizationFailure::StateMismatch).to_string(),
            "Authorization error: state mismatch - possible CSRF attack"
        );
    }
}
