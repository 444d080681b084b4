//! Dynamic client registration (RFC 7591)
//!
//! A registration is persisted per deployment and reused for as long as it
//! still lists the redirect URI we are about to use.

use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::errors::OAuthErrorBody;
use super::metadata::AuthorizationServerMetadata;
use super::storage::{CredentialStore, StoreKeys};
use crate::{Error, Result};

/// How the client authenticates at the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// Public client, `client_id` only
    None,
    /// `client_secret` in the form body
    #[default]
    ClientSecretPost,
    /// HTTP Basic with `client_id:client_secret`
    ClientSecretBasic,
}

impl TokenEndpointAuthMethod {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretBasic => "client_secret_basic",
        }
    }
}

/// A registered OAuth client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client ID
    pub client_id: String,

    /// Client secret (confidential clients only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Registered redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Registered grant types
    #[serde(default)]
    pub grant_types: Vec<String>,
}

impl ClientRegistration {
    /// True when this registration can be used with `redirect_uri`
    #[must_use]
    pub fn accepts_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: [&'a str; 1],
    grant_types: [&'static str; 2],
    response_types: [&'static str; 1],
    token_endpoint_auth_method: &'static str,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    redirect_uris: Option<Vec<String>>,
    #[serde(default)]
    grant_types: Option<Vec<String>>,
}

/// Registers and persists the dynamic OAuth client for one deployment
pub struct ClientRegistry {
    http_client: Client,
    store: Arc<dyn CredentialStore>,
    keys: StoreKeys,
    client_name: String,
    auth_method: TokenEndpointAuthMethod,
}

impl ClientRegistry {
    /// Create a registry bound to one deployment's store keys
    #[must_use]
    pub fn new(
        http_client: Client,
        store: Arc<dyn CredentialStore>,
        keys: StoreKeys,
        client_name: String,
        auth_method: TokenEndpointAuthMethod,
    ) -> Self {
        Self {
            http_client,
            store,
            keys,
            client_name,
            auth_method,
        }
    }

    /// The persisted registration, if any
    pub async fn current(&self) -> Option<ClientRegistration> {
        let raw = self.store.get(&self.keys.client_registration()).await?;
        match serde_json::from_str::<ClientRegistration>(&raw) {
            Ok(reg) => Some(reg),
            Err(e) => {
                warn!(key = %self.keys.client_registration(), error = %e, "Ignoring unparsable client registration");
                None
            }
        }
    }

    /// Return a reusable registration or register a new client
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] if the server has no registration
    /// endpoint or rejects the request.
    pub async fn register(
        &self,
        metadata: &AuthorizationServerMetadata,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        if let Some(existing) = self.current().await {
            if existing.accepts_redirect(redirect_uri) {
                debug!(client_id = %existing.client_id, "Reusing stored client registration");
                return Ok(existing);
            }
            debug!(
                client_id = %existing.client_id,
                redirect_uri,
                "Stored registration does not cover redirect URI, re-registering"
            );
        }

        let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            Error::Registration(
                "authorization server does not support dynamic client registration".to_string(),
            )
        })?;

        let body = RegistrationRequest {
            client_name: &self.client_name,
            redirect_uris: [redirect_uri],
            grant_types: ["authorization_code", "refresh_token"],
            response_types: ["code"],
            token_endpoint_auth_method: self.auth_method.as_str(),
        };

        let response = self
            .http_client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Registration(format!("Client registration failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            let detail = OAuthErrorBody::from_slice(&body).map_or_else(
                || String::from_utf8_lossy(&body).into_owned(),
                |e| e.to_string(),
            );
            return Err(Error::Registration(format!(
                "Client registration failed: HTTP {status} - {detail}"
            )));
        }

        let reg: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| Error::Registration(format!("Failed to parse registration response: {e}")))?;

        let registration = ClientRegistration {
            client_id: reg.client_id,
            client_secret: reg.client_secret,
            redirect_uris: reg
                .redirect_uris
                .unwrap_or_else(|| vec![redirect_uri.to_string()]),
            grant_types: reg.grant_types.unwrap_or_else(|| {
                vec!["authorization_code".to_string(), "refresh_token".to_string()]
            }),
        };

        let encoded = serde_json::to_string(&registration)
            .map_err(|e| Error::Internal(format!("Failed to serialize registration: {e}")))?;
        self.store
            .set(&self.keys.client_registration(), &encoded)
            .await?;

        info!(client_id = %registration.client_id, "Registered OAuth client");
        Ok(registration)
    }

    /// Drop the persisted registration so the next login registers again
    pub async fn forget(&self) -> Result<()> {
        self.store.delete(&self.keys.client_registration()).await
    }
}
