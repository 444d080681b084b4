//! OAuth Metadata Discovery
//!
//! Implements RFC 8414 (OAuth Authorization Server Metadata) and checks the
//! advertised capabilities against what this client needs.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::deployment::Deployment;
use crate::{Error, Result};

use super::TokenEndpointAuthMethod;

/// Well-known discovery path (RFC 8414 §3)
pub const DISCOVERY_PATH: &str = "/.well-known/oauth-authorization-server";

/// OAuth Authorization Server Metadata (RFC 8414)
///
/// Capability lists are kept as `Option` so an absent list can fall back to
/// its RFC 8414 default instead of being read as "nothing supported".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    #[serde(default)]
    pub issuer: String,

    /// Authorization endpoint URL
    #[serde(default)]
    pub authorization_endpoint: String,

    /// Token endpoint URL
    #[serde(default)]
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Token revocation endpoint (optional)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Option<Vec<String>>,

    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Option<Vec<String>>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported token endpoint auth methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Option<Vec<String>>,
}

/// Deserialize scopes that may be either a string or array
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

impl AuthorizationServerMetadata {
    /// Grant types, defaulting to `["authorization_code"]` when absent
    #[must_use]
    pub fn grant_types(&self) -> Vec<String> {
        self.grant_types_supported
            .clone()
            .unwrap_or_else(|| vec!["authorization_code".to_string()])
    }

    /// Response types, defaulting to `["code"]` when absent
    #[must_use]
    pub fn response_types(&self) -> Vec<String> {
        self.response_types_supported
            .clone()
            .unwrap_or_else(|| vec!["code".to_string()])
    }

    /// Token endpoint auth methods, defaulting to `["client_secret_basic"]` when absent
    #[must_use]
    pub fn token_endpoint_auth_methods(&self) -> Vec<String> {
        self.token_endpoint_auth_methods_supported
            .clone()
            .unwrap_or_else(|| vec!["client_secret_basic".to_string()])
    }

    /// Check if PKCE is supported (S256 method). Absence means unsupported.
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .as_ref()
            .is_some_and(|methods| methods.iter().any(|m| m == "S256"))
    }

    /// Verify required endpoints and capabilities
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] naming the first missing field or capability.
    pub fn validate(&self, auth_method: TokenEndpointAuthMethod) -> Result<()> {
        for (name, value) in [
            ("issuer", &self.issuer),
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Discovery(format!("metadata is missing {name}")));
            }
        }

        let grant_types = self.grant_types();
        for required in ["authorization_code", "refresh_token"] {
            if !grant_types.iter().any(|g| g == required) {
                return Err(Error::Discovery(format!(
                    "server does not support the {required} grant"
                )));
            }
        }

        if !self.response_types().iter().any(|r| r == "code") {
            return Err(Error::Discovery(
                "server does not support response type \"code\"".to_string(),
            ));
        }

        if !self
            .token_endpoint_auth_methods()
            .iter()
            .any(|m| m == auth_method.as_str())
        {
            return Err(Error::Discovery(format!(
                "server does not support token endpoint auth method {}",
                auth_method.as_str()
            )));
        }

        if !self.supports_pkce() {
            return Err(Error::Discovery(
                "server does not support PKCE with S256".to_string(),
            ));
        }

        Ok(())
    }
}

/// Fetches and validates authorization server metadata
#[derive(Clone)]
pub struct MetadataClient {
    http_client: Client,
    auth_method: TokenEndpointAuthMethod,
}

impl MetadataClient {
    /// Create a metadata client that requires `auth_method` at the token endpoint
    #[must_use]
    pub fn new(http_client: Client, auth_method: TokenEndpointAuthMethod) -> Self {
        Self {
            http_client,
            auth_method,
        }
    }

    /// Discover and validate authorization server metadata for a deployment
    ///
    /// No retries; the caller decides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the document is unreachable, unparsable or
    /// lacks a required capability.
    pub async fn discover(&self, deployment: &Deployment) -> Result<AuthorizationServerMetadata> {
        let url = deployment.join(DISCOVERY_PATH)?;
        debug!(url = %url, "Discovering OAuth authorization server metadata");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to fetch OAuth metadata: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Discovery(format!(
                "OAuth metadata discovery failed: HTTP {}",
                response.status()
            )));
        }

        let metadata: AuthorizationServerMetadata = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to parse OAuth metadata: {e}")))?;

        metadata.validate(self.auth_method)?;

        debug!(issuer = %metadata.issuer, "Discovered authorization server");
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: "https://auth.example.com".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            registration_endpoint: Some("https://auth.example.com/register".to_string()),
            revocation_endpoint: None,
            grant_types_supported: Some(vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ]),
            response_types_supported: None,
            scopes_supported: vec![],
            token_endpoint_auth_methods_supported: Some(vec![
                "client_secret_post".to_string(),
                "none".to_string(),
            ]),
            code_challenge_methods_supported: Some(vec!["S256".to_string()]),
        }
    }

    // =========================================================================
    // deserialize_scopes
    // =========================================================================

    #[test]
    fn scopes_from_string() {
        let json = r#"{
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
            "scopes_supported": "read write admin"
        }"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write", "admin"]);
    }

    #[test]
    fn scopes_missing_field() {
        let json = r#"{"issuer": "https://auth.example.com"}"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.scopes_supported.is_empty());
        assert!(meta.grant_types_supported.is_none());
    }

    // =========================================================================
    // RFC 8414 defaults
    // =========================================================================

    #[test]
    fn absent_lists_use_rfc_defaults() {
        let meta = AuthorizationServerMetadata::default();
        assert_eq!(meta.grant_types(), vec!["authorization_code"]);
        assert_eq!(meta.response_types(), vec!["code"]);
        assert_eq!(meta.token_endpoint_auth_methods(), vec!["client_secret_basic"]);
        assert!(!meta.supports_pkce());
    }

    #[test]
    fn empty_challenge_list_is_unsupported() {
        let mut meta = capable();
        meta.code_challenge_methods_supported = Some(vec![]);
        assert!(!meta.supports_pkce());
        meta.code_challenge_methods_supported = Some(vec!["plain".to_string()]);
        assert!(!meta.supports_pkce());
    }

    // =========================================================================
    // validate
    // =========================================================================

    #[test]
    fn capable_server_validates() {
        assert!(capable().validate(TokenEndpointAuthMethod::ClientSecretPost).is_ok());
        assert!(capable().validate(TokenEndpointAuthMethod::None).is_ok());
    }

    #[test]
    fn missing_endpoints_fail() {
        for field in ["issuer", "authorization_endpoint", "token_endpoint"] {
            let mut meta = capable();
            match field {
                "issuer" => meta.issuer.clear(),
                "authorization_endpoint" => meta.authorization_endpoint.clear(),
                _ => meta.token_endpoint.clear(),
            }
            let err = meta
                .validate(TokenEndpointAuthMethod::ClientSecretPost)
                .unwrap_err();
            assert!(matches!(&err, Error::Discovery(m) if m.contains(field)), "{err}");
        }
    }

    #[test]
    fn default_grant_types_lack_refresh() {
        let mut meta = capable();
        meta.grant_types_supported = None;
        let err = meta
            .validate(TokenEndpointAuthMethod::ClientSecretPost)
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(m) if m.contains("refresh_token")));
    }

    #[test]
    fn unsupported_auth_method_fails() {
        let meta = capable();
        assert!(meta
            .validate(TokenEndpointAuthMethod::ClientSecretBasic)
            .is_err());
    }

    #[test]
    fn default_auth_method_is_basic() {
        let mut meta = capable();
        meta.token_endpoint_auth_methods_supported = None;
        assert!(meta
            .validate(TokenEndpointAuthMethod::ClientSecretBasic)
            .is_ok());
        assert!(meta.validate(TokenEndpointAuthMethod::ClientSecretPost).is_err());
    }

    #[test]
    fn missing_pkce_fails() {
        let mut meta = capable();
        meta.code_challenge_methods_supported = None;
        let err = meta.validate(TokenEndpointAuthMethod::None).unwrap_err();
        assert!(matches!(err, Error::Discovery(m) if m.contains("S256")));
    }

    #[test]
    fn response_type_without_code_fails() {
        let mut meta = capable();
        meta.response_types_supported = Some(vec!["token".to_string()]);
        assert!(meta.validate(TokenEndpointAuthMethod::None).is_err());
    }
}
