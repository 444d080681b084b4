//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::oauth::{
    CALLBACK_PATH, DEFAULT_SESSION_HEADER, OAuthSettings, TokenEndpointAuthMethod, default_directory,
};
use crate::{Error, Result};

/// Environment variable prefix; nested keys use `__`
pub const ENV_PREFIX: &str = "REMOTE_OAUTH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OAuth client configuration
    pub oauth: OAuthConfig,
    /// Credential store configuration
    pub store: StoreConfig,
    /// HTTP client configuration
    pub http: HttpConfig,
}

/// OAuth client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Name sent at dynamic client registration
    pub client_name: String,
    /// Required scopes (`prefix:*` wildcards allowed)
    pub scopes: Vec<String>,
    /// Loopback redirect URI; the path must be `/oauth/callback`
    pub redirect_uri: String,
    /// Token endpoint client authentication
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    /// Header carrying the access token on API requests
    pub session_header: String,
    /// Refresh this long before expiry
    #[serde(with = "humantime_serde")]
    pub refresh_threshold: Duration,
    /// Minimum time between two refresh attempts
    #[serde(with = "humantime_serde")]
    pub throttle_interval: Duration,
    /// Retry delay for failed background refreshes
    #[serde(with = "humantime_serde")]
    pub background_retry_interval: Duration,
    /// How long to wait for the browser callback
    #[serde(with = "humantime_serde")]
    pub authorization_timeout: Duration,
    /// Token lifetime assumed when the server omits `expires_in`
    #[serde(with = "humantime_serde")]
    pub default_token_lifetime: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        let settings = OAuthSettings::default();
        Self {
            client_name: settings.client_name,
            scopes: settings.scopes,
            redirect_uri: settings.redirect_uri,
            token_endpoint_auth_method: settings.auth_method,
            session_header: DEFAULT_SESSION_HEADER.to_string(),
            refresh_threshold: settings.refresh_threshold,
            throttle_interval: settings.throttle_interval,
            background_retry_interval: settings.background_retry_interval,
            authorization_timeout: settings.authorization_timeout,
            default_token_lifetime: settings.default_token_lifetime,
        }
    }
}

impl OAuthConfig {
    /// Runtime settings for the token lifecycle manager
    #[must_use]
    pub fn settings(&self) -> OAuthSettings {
        OAuthSettings {
            client_name: self.client_name.clone(),
            scopes: self.scopes.clone(),
            redirect_uri: self.redirect_uri.clone(),
            auth_method: self.token_endpoint_auth_method,
            refresh_threshold: self.refresh_threshold,
            throttle_interval: self.throttle_interval,
            background_retry_interval: self.background_retry_interval,
            authorization_timeout: self.authorization_timeout,
            default_token_lifetime: self.default_token_lifetime,
        }
    }
}

/// Credential store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// One file per key, shared by every process of the user
    #[default]
    File,
    /// Process-local, lost on exit
    Memory,
}

/// Credential store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend
    pub kind: StoreKind,
    /// Directory for the file backend (default: platform config dir)
    pub directory: Option<PathBuf>,
}

impl StoreConfig {
    /// Directory the file backend uses
    pub fn resolved_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(dir.clone()),
            None => default_directory(),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // REMOTE_OAUTH_OAUTH__CLIENT_NAME=... -> oauth.client_name
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session layer cannot work with
    pub fn validate(&self) -> Result<()> {
        let oauth = &self.oauth;
        if oauth.client_name.trim().is_empty() {
            return Err(Error::Config("oauth.client_name must not be empty".to_string()));
        }

        let redirect = Url::parse(&oauth.redirect_uri).map_err(|e| {
            Error::Config(format!("oauth.redirect_uri {} is invalid: {e}", oauth.redirect_uri))
        })?;
        if redirect.path() != CALLBACK_PATH {
            return Err(Error::Config(format!(
                "oauth.redirect_uri path must be {CALLBACK_PATH}, got {}",
                redirect.path()
            )));
        }

        if oauth.throttle_interval.is_zero() {
            return Err(Error::Config("oauth.throttle_interval must be positive".to_string()));
        }
        if oauth.background_retry_interval.is_zero() {
            return Err(Error::Config(
                "oauth.background_retry_interval must be positive".to_string(),
            ));
        }
        if oauth.session_header.is_empty() {
            return Err(Error::Config("oauth.session_header must not be empty".to_string()));
        }
        Ok(())
    }

    /// HTTP client for discovery, registration and token requests
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.http.timeout)
            .user_agent(concat!("remote-oauth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
    }
}

/// Human-readable duration serialization (e.g. "30s", "10m", "1h", "250ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct Wrapper {
        #[serde(with = "humantime_serde")]
        d: Duration,
    }

    fn duration(raw: &str) -> Duration {
        serde_json::from_str::<Wrapper>(&format!(r#"{{"d":"{raw}"}}"#))
            .unwrap()
            .d
    }

    // =========================================================================
    // Durations
    // =========================================================================

    #[test]
    fn parses_duration_units() {
        assert_eq!(duration("30s"), Duration::from_secs(30));
        assert_eq!(duration("10m"), Duration::from_secs(600));
        assert_eq!(duration("1h"), Duration::from_secs(3600));
        assert_eq!(duration("250ms"), Duration::from_millis(250));
        assert_eq!(duration("45"), Duration::from_secs(45));
    }

    #[test]
    fn serializes_subsecond_as_millis() {
        let json = serde_json::to_string(&Wrapper {
            d: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, r#"{"d":"1500ms"}"#);
    }

    #[test]
    fn rejects_garbage_duration() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"d":"soon"}"#).is_err());
    }

    // =========================================================================
    // Defaults and loading
    // =========================================================================

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.oauth.redirect_uri, "http://127.0.0.1:53682/oauth/callback");
        assert_eq!(
            config.oauth.token_endpoint_auth_method,
            TokenEndpointAuthMethod::ClientSecretPost
        );
        assert_eq!(config.oauth.session_header, "X-Session-Token");
        assert_eq!(config.oauth.refresh_threshold, Duration::from_secs(600));
        assert_eq!(config.oauth.throttle_interval, Duration::from_secs(30));
        assert_eq!(config.oauth.authorization_timeout, Duration::from_secs(300));
        assert_eq!(config.store.kind, StoreKind::File);
        config.validate().unwrap();
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "oauth:\n  client_name: editor\n  scopes: [\"user:read\", \"workspace:*\"]\n  throttle_interval: 2m\n  token_endpoint_auth_method: none\nstore:\n  kind: memory\nhttp:\n  timeout: 5s"
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.oauth.client_name, "editor");
        assert_eq!(config.oauth.scopes, vec!["user:read", "workspace:*"]);
        assert_eq!(config.oauth.throttle_interval, Duration::from_secs(120));
        assert_eq!(config.oauth.token_endpoint_auth_method, TokenEndpointAuthMethod::None);
        // Untouched keys keep their defaults
        assert_eq!(config.oauth.refresh_threshold, Duration::from_secs(600));
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.http.timeout, Duration::from_secs(5));

        let settings = config.oauth.settings();
        assert_eq!(settings.throttle_interval, Duration::from_secs(120));
        assert_eq!(settings.auth_method, TokenEndpointAuthMethod::None);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/remote-oauth.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn redirect_path_must_be_callback() {
        let mut config = Config::default();
        config.oauth.redirect_uri = "http://127.0.0.1:1/callback".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_throttle_rejected() {
        let mut config = Config::default();
        config.oauth.throttle_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn empty_client_name_rejected() {
        let mut config = Config::default();
        config.oauth.client_name = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn explicit_store_directory_wins() {
        let config = StoreConfig {
            kind: StoreKind::File,
            directory: Some(PathBuf::from("/tmp/creds")),
        };
        assert_eq!(config.resolved_directory().unwrap(), PathBuf::from("/tmp/creds"));
    }
}
