//! OAuth error payloads
//!
//! Error responses from the token, registration and revocation endpoints
//! (RFC 6749 §5.2, RFC 7591 §3.2.2, RFC 7009 §2.2.1) are decoded into a closed
//! set of known codes with an `Unknown` fallback.

use std::fmt;

use serde::Deserialize;

/// Known OAuth error codes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OAuthErrorCode {
    /// `invalid_request`
    InvalidRequest,
    /// `invalid_client`
    InvalidClient,
    /// `invalid_grant`
    InvalidGrant,
    /// `unauthorized_client`
    UnauthorizedClient,
    /// `unsupported_grant_type`
    UnsupportedGrantType,
    /// `invalid_scope`
    InvalidScope,
    /// `access_denied`
    AccessDenied,
    /// `unsupported_response_type`
    UnsupportedResponseType,
    /// `server_error`
    ServerError,
    /// `temporarily_unavailable`
    TemporarilyUnavailable,
    /// `unsupported_token_type` (RFC 7009)
    UnsupportedTokenType,
    /// `invalid_redirect_uri` (RFC 7591)
    InvalidRedirectUri,
    /// `invalid_client_metadata` (RFC 7591)
    InvalidClientMetadata,
    /// Anything else the server sent
    Unknown(String),
}

impl OAuthErrorCode {
    /// Decode a wire error code. Total: every input maps to exactly one variant.
    #[must_use]
    pub fn parse(code: &str) -> Self {
        match code {
            "invalid_request" => Self::InvalidRequest,
            "invalid_client" => Self::InvalidClient,
            "invalid_grant" => Self::InvalidGrant,
            "unauthorized_client" => Self::UnauthorizedClient,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "invalid_scope" => Self::InvalidScope,
            "access_denied" => Self::AccessDenied,
            "unsupported_response_type" => Self::UnsupportedResponseType,
            "server_error" => Self::ServerError,
            "temporarily_unavailable" => Self::TemporarilyUnavailable,
            "unsupported_token_type" => Self::UnsupportedTokenType,
            "invalid_redirect_uri" => Self::InvalidRedirectUri,
            "invalid_client_metadata" => Self::InvalidClientMetadata,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::UnsupportedTokenType => "unsupported_token_type",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::InvalidClientMetadata => "invalid_client_metadata",
            Self::Unknown(code) => code,
        }
    }

    /// The stored grant or client is permanently unusable
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::InvalidGrant | Self::InvalidClient)
    }

    /// The server asked us to come back later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServerError | Self::TemporarilyUnavailable)
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OAuthErrorCode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// OAuth error response body
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    /// Error code
    pub error: OAuthErrorCode,

    /// Error description
    #[serde(default)]
    pub error_description: Option<String>,

    /// Error URI
    #[serde(default)]
    pub error_uri: Option<String>,
}

impl OAuthErrorBody {
    /// Parse an error body, returning `None` when it is not an OAuth error document
    #[must_use]
    pub fn from_slice(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}

impl fmt::Display for OAuthErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(d) => write!(f, "{}: {d}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_codes_round_trip() {
        for code in [
            "invalid_request",
            "invalid_client",
            "invalid_grant",
            "unauthorized_client",
            "unsupported_grant_type",
            "invalid_scope",
            "access_denied",
            "server_error",
            "temporarily_unavailable",
        ] {
            let parsed = OAuthErrorCode::parse(code);
            assert!(!matches!(parsed, OAuthErrorCode::Unknown(_)), "{code}");
            assert_eq!(parsed.as_str(), code);
        }
    }

    #[test]
    fn unknown_code_is_preserved() {
        let parsed = OAuthErrorCode::parse("slow_down");
        assert_eq!(parsed, OAuthErrorCode::Unknown("slow_down".to_string()));
        assert!(!parsed.requires_reauthentication());
    }

    #[test]
    fn only_grant_and_client_errors_require_reauth() {
        assert!(OAuthErrorCode::InvalidGrant.requires_reauthentication());
        assert!(OAuthErrorCode::InvalidClient.requires_reauthentication());
        assert!(!OAuthErrorCode::InvalidRequest.requires_reauthentication());
        assert!(!OAuthErrorCode::ServerError.requires_reauthentication());
        assert!(!OAuthErrorCode::InvalidScope.requires_reauthentication());
    }

    #[test]
    fn body_parses_with_description() {
        let body = OAuthErrorBody::from_slice(
            br#"{"error":"invalid_grant","error_description":"refresh token expired"}"#,
        )
        .unwrap();
        assert_eq!(body.error, OAuthErrorCode::InvalidGrant);
        assert_eq!(body.to_string(), "invalid_grant: refresh token expired");
    }

    #[test]
    fn non_oauth_body_is_none() {
        assert!(OAuthErrorBody::from_slice(b"<html>forbidden</html>").is_none());
        assert!(OAuthErrorBody::from_slice(br#"{"message":"nope"}"#).is_none());
    }
}
