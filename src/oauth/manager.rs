//! Token lifecycle manager
//!
//! One [`TokenLifecycleManager`] exists per deployment. It owns the in-memory
//! copy of the token record, schedules proactive refresh, deduplicates
//! concurrent refreshes, and converges with other processes that share the
//! credential store: every write goes through the store, and every change the
//! store reports is re-read.
//!
//! ```text
//! LoggedOut -> Authorizing -> Exchanging -> Authenticated <-> Refreshing
//!                                                |               |
//!                                                +---> Invalid <-+
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::authorization::{
    AuthorizationCoordinator, AuthorizationRequest, CallbackOutcome, DEFAULT_AUTHORIZATION_TIMEOUT,
};
use super::callback::CallbackParams;
use super::collaborators::{BrowserOpener, LogReauthPrompt, ReauthPrompt, SystemBrowser};
use super::errors::{OAuthErrorBody, OAuthErrorCode};
use super::metadata::{AuthorizationServerMetadata, MetadataClient};
use super::registration::{ClientRegistration, ClientRegistry, TokenEndpointAuthMethod};
use super::single_flight::{Flight, SingleFlight};
use super::storage::{CredentialStore, StoreKeys, StoreSubscription};
use super::token::{TokenRecord, TokenResponse, refresh_delay};
use crate::deployment::Deployment;
use crate::error::RefreshFailure;
use crate::{Error, Result};

/// Runtime OAuth settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSettings {
    /// `client_name` sent at registration
    pub client_name: String,
    /// Scopes every usable token must carry
    pub scopes: Vec<String>,
    /// Redirect URI registered for the client
    pub redirect_uri: String,
    /// Token endpoint client authentication
    pub auth_method: TokenEndpointAuthMethod,
    /// Refresh this long before expiry
    pub refresh_threshold: Duration,
    /// Minimum time between the starts of two refresh attempts
    pub throttle_interval: Duration,
    /// Delay before a failed background refresh is retried
    pub background_retry_interval: Duration,
    /// Wait for the browser callback
    pub authorization_timeout: Duration,
    /// Lifetime assumed when the server omits `expires_in`
    pub default_token_lifetime: Duration,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_name: "remote-oauth".to_string(),
            scopes: Vec::new(),
            redirect_uri: "http://127.0.0.1:53682/oauth/callback".to_string(),
            auth_method: TokenEndpointAuthMethod::default(),
            refresh_threshold: Duration::from_secs(10 * 60),
            throttle_interval: Duration::from_secs(30),
            background_retry_interval: Duration::from_secs(60),
            authorization_timeout: DEFAULT_AUTHORIZATION_TIMEOUT,
            default_token_lifetime: Duration::from_secs(60 * 60),
        }
    }
}

impl OAuthSettings {
    fn requested_scope(&self) -> Option<String> {
        (!self.scopes.is_empty()).then(|| self.scopes.join(" "))
    }
}

/// Collaborators and settings for [`TokenLifecycleManager::create`]
pub struct ManagerOptions {
    settings: OAuthSettings,
    http_client: Client,
    browser: Arc<dyn BrowserOpener>,
    reauth_prompt: Arc<dyn ReauthPrompt>,
}

impl ManagerOptions {
    /// Options using the system browser and a logging re-auth prompt
    #[must_use]
    pub fn new(settings: OAuthSettings, http_client: Client) -> Self {
        Self {
            settings,
            http_client,
            browser: Arc::new(SystemBrowser),
            reauth_prompt: Arc::new(LogReauthPrompt),
        }
    }

    /// Replace the browser collaborator
    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserOpener>) -> Self {
        self.browser = browser;
        self
    }

    /// Replace the re-auth prompt collaborator
    #[must_use]
    pub fn with_reauth_prompt(mut self, prompt: Arc<dyn ReauthPrompt>) -> Self {
        self.reauth_prompt = prompt;
        self
    }
}

/// Session state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No token
    LoggedOut,
    /// Waiting for the browser callback
    Authorizing,
    /// Exchanging the authorization code
    Exchanging,
    /// Holding a usable token
    Authenticated,
    /// Holding a token while a refresh runs
    Refreshing,
    /// Credentials were rejected; only a fresh login recovers
    Invalid,
}

/// Snapshot returned by [`TokenLifecycleManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Deployment stable identifier
    pub deployment: String,
    /// Current state
    pub state: SessionState,
    /// Expiry of the current token
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scope
    pub scope: Option<String>,
    /// Whether the token can be refreshed
    pub has_refresh_token: bool,
    /// When the armed refresh timer fires
    pub next_refresh_at: Option<DateTime<Utc>>,
}

struct ScheduledRefresh {
    id: u64,
    due: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Inner {
    deployment: Deployment,
    keys: StoreKeys,
    store: Arc<dyn CredentialStore>,
    settings: OAuthSettings,
    http_client: Client,
    metadata_client: MetadataClient,
    registry: ClientRegistry,
    coordinator: Arc<AuthorizationCoordinator>,
    reauth_prompt: Arc<dyn ReauthPrompt>,

    state: RwLock<SessionState>,
    record: RwLock<Option<TokenRecord>>,
    metadata: RwLock<Option<AuthorizationServerMetadata>>,
    presence: watch::Sender<bool>,

    refresh_flight: SingleFlight<Result<TokenRecord>>,
    refresh_cancel: Mutex<CancellationToken>,
    last_refresh_start: Mutex<Option<Instant>>,
    reauth_flight: SingleFlight<()>,

    timer: Mutex<Option<ScheduledRefresh>>,
    next_timer_id: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

/// Owns the OAuth session of one deployment
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

impl TokenLifecycleManager {
    /// Create the manager, load stored credentials and start watching the store
    ///
    /// A stored record that does not cover the required scopes is deleted. A
    /// stored record that has already expired is refreshed right away, even
    /// inside the throttle window.
    pub async fn create(
        deployment: Deployment,
        store: Arc<dyn CredentialStore>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let ManagerOptions {
            settings,
            http_client,
            browser,
            reauth_prompt,
        } = options;

        let keys = StoreKeys::new(deployment.stable_identifier());
        let registry = ClientRegistry::new(
            http_client.clone(),
            Arc::clone(&store),
            keys.clone(),
            settings.client_name.clone(),
            settings.auth_method,
        );
        let coordinator = Arc::new(AuthorizationCoordinator::new(
            browser,
            settings.authorization_timeout,
        ));
        let (presence, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            metadata_client: MetadataClient::new(http_client.clone(), settings.auth_method),
            deployment,
            keys,
            store,
            settings,
            http_client,
            registry,
            coordinator,
            reauth_prompt,
            state: RwLock::new(SessionState::LoggedOut),
            record: RwLock::new(None),
            metadata: RwLock::new(None),
            presence,
            refresh_flight: SingleFlight::new(),
            refresh_cancel: Mutex::new(CancellationToken::new()),
            last_refresh_start: Mutex::new(None),
            reauth_flight: SingleFlight::new(),
            timer: Mutex::new(None),
            next_timer_id: AtomicU64::new(0),
            watcher: Mutex::new(None),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        // Subscribe before the first read so no write slips between them
        let subscription = inner.store.watch(&inner.keys.token_metadata());

        let stored = inner.read_stored_record().await;
        match stored {
            Some(record) if !record.covers_scopes(&inner.settings.scopes) => {
                warn!(
                    deployment = %inner.deployment,
                    granted = ?record.scope,
                    required = ?inner.settings.scopes,
                    "Stored token lacks required scopes, discarding"
                );
                inner.delete_stored_record().await?;
            }
            Some(record) => {
                let expired = record.is_expired();
                let refreshable = record.refresh_token.is_some();
                info!(
                    deployment = %inner.deployment,
                    expires_at = %record.expires_at,
                    "Loaded stored OAuth token"
                );
                inner.adopt(record);
                if expired && refreshable {
                    debug!("Stored token already expired, refreshing immediately");
                    let task = Arc::clone(&inner);
                    tokio::spawn(async move { task.background_refresh(true).await });
                } else {
                    inner.schedule();
                }
            }
            None => debug!(deployment = %inner.deployment, "No stored OAuth token"),
        }

        let weak = Arc::downgrade(&inner);
        *inner.watcher.lock() = Some(tokio::spawn(watch_store(weak, subscription)));

        Ok(Self { inner })
    }

    /// Stop all background work
    ///
    /// Cancels the refresh timer, aborts an in-flight refresh, rejects a
    /// pending authorization and unsubscribes from the store, in that order.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.cancel_timer();
        inner.refresh_cancel.lock().cancel();
        inner.coordinator.cancel();
        let watcher = inner.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        inner.shutdown.cancel();
        debug!(deployment = %inner.deployment, "Token lifecycle manager disposed");
    }

    /// Deployment this manager serves
    pub fn deployment(&self) -> &Deployment {
        &self.inner.deployment
    }

    /// Effective settings
    pub fn settings(&self) -> &OAuthSettings {
        &self.inner.settings
    }

    /// Authorization coordinator, for callback collaborators
    pub fn coordinator(&self) -> Arc<AuthorizationCoordinator> {
        Arc::clone(&self.inner.coordinator)
    }

    /// Deliver a redirect callback to the pending login
    pub fn handle_callback(&self, params: &CallbackParams) -> CallbackOutcome {
        self.inner.coordinator.handle_callback(params)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Current token record
    pub fn current_record(&self) -> Option<TokenRecord> {
        self.inner.record.read().clone()
    }

    /// Current access token
    pub fn current_access_token(&self) -> Option<String> {
        self.inner
            .record
            .read()
            .as_ref()
            .map(|r| r.access_token.clone())
    }

    /// Token presence; `true` while a token is held
    pub fn subscribe_presence(&self) -> watch::Receiver<bool> {
        self.inner.presence.subscribe()
    }

    /// Status snapshot
    pub fn status(&self) -> SessionStatus {
        let record = self.inner.record.read().clone();
        let next_refresh_at = self.inner.timer.lock().as_ref().map(|t| t.due);
        SessionStatus {
            deployment: self.inner.deployment.stable_identifier().to_string(),
            state: self.state(),
            expires_at: record.as_ref().map(|r| r.expires_at),
            scope: record.as_ref().and_then(|r| r.scope.clone()),
            has_refresh_token: record.as_ref().is_some_and(|r| r.refresh_token.is_some()),
            next_refresh_at,
        }
    }

    /// Run the full login: discovery, registration, browser authorization and
    /// code exchange, using the configured redirect URI
    pub async fn login(&self) -> Result<TokenRecord> {
        let redirect_uri = self.inner.settings.redirect_uri.clone();
        self.login_with_redirect_uri(&redirect_uri).await
    }

    /// Run the full login with an explicit redirect URI
    ///
    /// Used when the callback server bound an ephemeral port.
    pub async fn login_with_redirect_uri(&self, redirect_uri: &str) -> Result<TokenRecord> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let previous_state = self.state();
        inner.set_state(SessionState::Authorizing);

        let outcome = inner.run_login(redirect_uri).await;
        match &outcome {
            Ok(record) => {
                info!(
                    deployment = %inner.deployment,
                    expires_at = %record.expires_at,
                    scope = ?record.scope,
                    "Logged in"
                );
            }
            Err(e) => {
                warn!(deployment = %inner.deployment, error = %e, "Login failed");
                let has_record = inner.record.read().is_some();
                inner.set_state(if has_record {
                    SessionState::Authenticated
                } else if previous_state == SessionState::Invalid {
                    SessionState::Invalid
                } else {
                    SessionState::LoggedOut
                });
            }
        }
        outcome
    }

    /// Refresh the access token
    ///
    /// Concurrent callers share one attempt and observe the same outcome. A
    /// new attempt is refused with [`RefreshFailure::Throttled`] while the
    /// previous one started less than the throttle interval ago.
    pub async fn refresh(&self) -> Result<TokenRecord> {
        self.inner.start_refresh(false)?.await
    }

    /// True when a proactive refresh would be useful and allowed now
    pub fn should_refresh(&self) -> bool {
        let inner = &self.inner;
        let refreshable_soon = inner.record.read().as_ref().is_some_and(|r| {
            r.refresh_token.is_some() && r.expires_within(inner.settings.refresh_threshold, Utc::now())
        });
        refreshable_soon && !inner.refresh_flight.in_flight() && !inner.throttled()
    }

    /// Revoke the current grant at the revocation endpoint, best-effort
    ///
    /// Failures are logged and never returned.
    pub async fn revoke(&self) {
        if let Err(e) = self.inner.try_revoke().await {
            warn!(deployment = %self.inner.deployment, error = %e, "Token revocation failed");
        }
    }

    /// Stop scheduling, revoke best-effort and clear stored credentials
    pub async fn logout(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_timer();
        inner.refresh_cancel.lock().cancel();
        self.revoke().await;
        inner.clear(SessionState::LoggedOut).await?;
        info!(deployment = %inner.deployment, "Logged out");
        Ok(())
    }

    /// Treat the current credentials as permanently rejected
    ///
    /// Clears stored credentials, marks the session invalid and notifies the
    /// re-auth prompt once per burst.
    pub async fn require_reauthentication(&self, reason: &str) {
        let inner = &self.inner;
        if let Err(e) = inner.clear(SessionState::Invalid).await {
            warn!(error = %e, "Failed to clear rejected credentials");
        }
        inner.notify_reauth(reason.to_string());
    }

    /// Start a refresh in the background and return immediately
    pub fn refresh_in_background(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.background_refresh(false).await });
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn throttled(&self) -> bool {
        self.last_refresh_start
            .lock()
            .is_some_and(|t| t.elapsed() < self.settings.throttle_interval)
    }

    /// Install `record` as the in-memory truth
    fn adopt(&self, record: TokenRecord) {
        *self.record.write() = Some(record);
        if !self.refresh_flight.in_flight() {
            self.set_state(SessionState::Authenticated);
        }
        self.presence.send_replace(true);
    }

    fn forget_in_memory(&self, state: SessionState) {
        self.cancel_timer();
        *self.record.write() = None;
        self.set_state(state);
        self.presence.send_replace(false);
    }

    async fn clear(&self, state: SessionState) -> Result<()> {
        self.forget_in_memory(state);
        self.delete_stored_record().await
    }

    // ------------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------------

    async fn read_stored_record(&self) -> Option<TokenRecord> {
        let raw = self.store.get(&self.keys.token_metadata()).await?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %self.keys.token_metadata(), error = %e, "Ignoring unparsable token record");
                None
            }
        }
    }

    async fn save_record(&self, record: &TokenRecord) -> Result<()> {
        let encoded = serde_json::to_string(record)
            .map_err(|e| Error::Internal(format!("Failed to serialize token record: {e}")))?;
        self.store.set(&self.keys.token_metadata(), &encoded).await?;
        self.store
            .set(&self.keys.session_token(), &record.access_token)
            .await
    }

    async fn delete_stored_record(&self) -> Result<()> {
        let tokens = self.store.delete(&self.keys.token_metadata()).await;
        let session = self.store.delete(&self.keys.session_token()).await;
        tokens.and(session)
    }

    /// Re-read the store after a change notification
    async fn reload(self: &Arc<Self>) {
        let stored = self.read_stored_record().await;
        let stored = stored.filter(|r| {
            let covered = r.covers_scopes(&self.settings.scopes);
            if !covered {
                warn!(deployment = %self.deployment, "Changed token lacks required scopes, ignoring");
            }
            covered
        });

        let current = self.record.read().clone();
        if stored == current {
            return;
        }

        match stored {
            Some(record) => {
                debug!(
                    deployment = %self.deployment,
                    expires_at = %record.expires_at,
                    "Adopting token written by another session"
                );
                self.adopt(record);
                self.schedule();
            }
            None => {
                debug!(deployment = %self.deployment, "Token removed by another session");
                let next = if *self.state.read() == SessionState::Invalid {
                    SessionState::Invalid
                } else {
                    SessionState::LoggedOut
                };
                self.forget_in_memory(next);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Metadata and token endpoint
    // ------------------------------------------------------------------------

    async fn metadata(&self) -> Result<AuthorizationServerMetadata> {
        let cached = self.metadata.read().clone();
        if let Some(metadata) = cached {
            return Ok(metadata);
        }
        self.discover().await
    }

    async fn discover(&self) -> Result<AuthorizationServerMetadata> {
        let metadata = self.metadata_client.discover(&self.deployment).await?;
        *self.metadata.write() = Some(metadata.clone());
        Ok(metadata)
    }

    /// Build a form POST authenticated as `registration`
    fn client_request(
        &self,
        endpoint: &str,
        registration: &ClientRegistration,
        mut form: Vec<(&'static str, String)>,
    ) -> RequestBuilder {
        let mut builder = self.http_client.post(endpoint);
        let secret = registration.client_secret.as_deref();
        match (self.settings.auth_method, secret) {
            (TokenEndpointAuthMethod::ClientSecretBasic, Some(secret)) => {
                builder = builder.basic_auth(&registration.client_id, Some(secret));
            }
            (TokenEndpointAuthMethod::ClientSecretPost, Some(secret)) => {
                form.push(("client_id", registration.client_id.clone()));
                form.push(("client_secret", secret.to_string()));
            }
            _ => form.push(("client_id", registration.client_id.clone())),
        }
        builder.form(&form)
    }

    async fn run_login(self: &Arc<Self>, redirect_uri: &str) -> Result<TokenRecord> {
        let metadata = self.discover().await?;
        let registration = self.registry.register(&metadata, redirect_uri).await?;

        let grant = self
            .coordinator
            .authorize(AuthorizationRequest {
                metadata: &metadata,
                registration: &registration,
                redirect_uri,
                scopes: &self.settings.scopes,
            })
            .await?;

        self.set_state(SessionState::Exchanging);
        let response = self
            .client_request(
                &metadata.token_endpoint,
                &registration,
                vec![
                    ("grant_type", "authorization_code".to_string()),
                    ("code", grant.code),
                    ("redirect_uri", grant.redirect_uri),
                    ("code_verifier", grant.verifier),
                ],
            )
            .send()
            .await
            .map_err(|e| Error::TokenExchange(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            let detail = OAuthErrorBody::from_slice(&body).map_or_else(
                || String::from_utf8_lossy(&body).into_owned(),
                |e| e.to_string(),
            );
            return Err(Error::TokenExchange(format!("HTTP {status} - {detail}")));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenExchange(format!("Failed to parse token response: {e}")))?;

        let requested = self.settings.requested_scope();
        let record = TokenRecord::from_response(
            token_response,
            None,
            requested.as_deref(),
            self.settings.default_token_lifetime,
            Utc::now(),
        );
        if !record.covers_scopes(&self.settings.scopes) {
            return Err(Error::TokenExchange(format!(
                "Granted scope {:?} does not cover required scopes {:?}",
                record.scope, self.settings.scopes
            )));
        }

        // An older refresh must not act on the grant this login replaces
        self.refresh_cancel.lock().cancel();
        self.save_record(&record).await?;
        *self.last_refresh_start.lock() = None;
        self.adopt(record.clone());
        self.schedule();
        Ok(record)
    }

    async fn try_revoke(&self) -> Result<()> {
        let record = match self.read_stored_record().await {
            Some(record) => Some(record),
            None => self.record.read().clone(),
        };
        let Some(record) = record else {
            return Ok(());
        };

        let metadata = self.metadata().await?;
        let Some(endpoint) = metadata.revocation_endpoint.as_deref() else {
            debug!("Authorization server does not advertise token revocation");
            return Ok(());
        };
        let Some(registration) = self.registry.current().await else {
            return Err(Error::Revocation("no client registration".to_string()));
        };

        let (token, hint) = match record.refresh_token {
            Some(refresh) => (refresh, "refresh_token"),
            None => (record.access_token, "access_token"),
        };
        let response = self
            .client_request(
                endpoint,
                &registration,
                vec![("token", token), ("token_type_hint", hint.to_string())],
            )
            .send()
            .await
            .map_err(|e| Error::Revocation(format!("Revocation request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Revocation(format!("HTTP {}", response.status())));
        }
        debug!(deployment = %self.deployment, "Token revoked");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    fn start_refresh(self: &Arc<Self>, bypass_throttle: bool) -> Result<Flight<Result<TokenRecord>>> {
        self.refresh_flight.try_run(|| {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(Error::refresh(RefreshFailure::Cancelled, "manager disposed"));
            }
            let refreshable = self
                .record
                .read()
                .as_ref()
                .is_some_and(|r| r.refresh_token.is_some());
            if !refreshable {
                return Err(Error::refresh(
                    RefreshFailure::NoCredentials,
                    "no refresh token available",
                ));
            }
            if !bypass_throttle && self.throttled() {
                return Err(Error::refresh(
                    RefreshFailure::Throttled,
                    "previous refresh attempt is too recent",
                ));
            }

            *self.last_refresh_start.lock() = Some(Instant::now());
            self.set_state(SessionState::Refreshing);

            let cancel = self.shutdown.child_token();
            *self.refresh_cancel.lock() = cancel.clone();

            let inner = Arc::clone(self);
            Ok(async move {
                let outcome = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(Error::refresh(RefreshFailure::Cancelled, "refresh aborted")),
                    outcome = inner.perform_refresh() => outcome,
                };
                inner.finish_refresh(&outcome).await;
                outcome
            }
            .boxed())
        })
    }

    async fn perform_refresh(self: &Arc<Self>) -> Result<TokenRecord> {
        let stored = self.read_stored_record().await;
        let in_memory = self.record.read().clone();

        // Another session may already have refreshed
        if let Some(stored) = &stored {
            let differs = in_memory
                .as_ref()
                .is_none_or(|m| m.access_token != stored.access_token);
            if differs
                && !stored.expires_within(self.settings.refresh_threshold, Utc::now())
                && stored.covers_scopes(&self.settings.scopes)
            {
                info!(deployment = %self.deployment, "Adopting token refreshed by another session");
                self.adopt(stored.clone());
                self.schedule();
                return Ok(stored.clone());
            }
        }

        let base = stored.or(in_memory).ok_or_else(|| {
            Error::refresh(RefreshFailure::NoCredentials, "no token record")
        })?;
        let refresh_token = base.refresh_token.clone().ok_or_else(|| {
            Error::refresh(RefreshFailure::NoCredentials, "no refresh token available")
        })?;

        let metadata = self
            .metadata()
            .await
            .map_err(|e| Error::refresh(RefreshFailure::Transient, e.to_string()))?;
        let registration = self.registry.current().await.ok_or_else(|| {
            Error::refresh(
                RefreshFailure::ReauthRequired(OAuthErrorCode::InvalidClient),
                "client registration missing",
            )
        })?;

        debug!(deployment = %self.deployment, "Refreshing OAuth token");
        let response = self
            .client_request(
                &metadata.token_endpoint,
                &registration,
                vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.clone()),
                ],
            )
            .send()
            .await
            .map_err(|e| Error::refresh(RefreshFailure::Transient, format!("Token refresh failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            let error = classify_refresh_failure(status, &body);
            if error.requires_reauthentication() {
                // Losing a rotation race is not a dead grant
                if let Some(rotated) = self.rotated_record(&refresh_token).await {
                    info!(
                        deployment = %self.deployment,
                        "Refresh token was rotated by another session, adopting its token"
                    );
                    self.adopt(rotated);
                    self.schedule();
                    return Err(Error::refresh(
                        RefreshFailure::Transient,
                        format!("refresh token superseded by another session ({error})"),
                    ));
                }
            }
            return Err(error);
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            Error::refresh(
                RefreshFailure::Transient,
                format!("Failed to parse refresh response: {e}"),
            )
        })?;

        let record = TokenRecord::from_response(
            token_response,
            Some(&base),
            None,
            self.settings.default_token_lifetime,
            Utc::now(),
        );
        if !record.covers_scopes(&self.settings.scopes) {
            return Err(Error::refresh(
                RefreshFailure::ReauthRequired(OAuthErrorCode::InvalidScope),
                format!(
                    "Refreshed scope {:?} does not cover required scopes {:?}",
                    record.scope, self.settings.scopes
                ),
            ));
        }
        self.save_record(&record).await?;
        self.adopt(record.clone());
        self.schedule();

        info!(
            deployment = %self.deployment,
            expires_at = %record.expires_at,
            "Token refreshed successfully"
        );
        Ok(record)
    }

    /// Stored record whose refresh token replaced `used`
    async fn rotated_record(&self, used: &str) -> Option<TokenRecord> {
        self.read_stored_record()
            .await
            .filter(|r| r.refresh_token.as_deref().is_some_and(|t| t != used))
            .filter(|r| r.covers_scopes(&self.settings.scopes))
    }

    async fn finish_refresh(&self, outcome: &Result<TokenRecord>) {
        let Err(e) = outcome else {
            self.set_state(SessionState::Authenticated);
            return;
        };

        if let Error::Refresh {
            kind: RefreshFailure::ReauthRequired(code),
            ..
        } = e
        {
            warn!(deployment = %self.deployment, error = %e, "Refresh rejected, credentials cleared");
            if *code == OAuthErrorCode::InvalidClient {
                if let Err(forget) = self.registry.forget().await {
                    warn!(error = %forget, "Failed to drop rejected client registration");
                }
            }
            if let Err(clear) = self.clear(SessionState::Invalid).await {
                warn!(error = %clear, "Failed to clear rejected credentials");
            }
            self.notify_reauth(e.to_string());
            return;
        }

        let has_record = self.record.read().is_some();
        self.set_state(if has_record {
            SessionState::Authenticated
        } else {
            SessionState::LoggedOut
        });
    }

    fn notify_reauth(&self, reason: String) {
        let prompt = Arc::clone(&self.reauth_prompt);
        let deployment = self.deployment.clone();
        drop(self.reauth_flight.run(move || {
            async move { prompt.reauthentication_required(&deployment, &reason).await }.boxed()
        }));
    }

    async fn background_refresh(self: Arc<Self>, bypass_throttle: bool) {
        let outcome = match self.start_refresh(bypass_throttle) {
            Ok(flight) => flight.await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(_) => {}
            Err(e)
                if e.is_transient()
                    || matches!(
                        e,
                        Error::Refresh {
                            kind: RefreshFailure::Throttled,
                            ..
                        }
                    ) =>
            {
                // Wait for the current record's own refresh point if it is later
                let due = self.record.read().as_ref().map_or(Duration::ZERO, |r| {
                    refresh_delay(r, self.settings.refresh_threshold, Utc::now())
                });
                let retry_in = due.max(self.settings.background_retry_interval);
                warn!(
                    deployment = %self.deployment,
                    error = %e,
                    retry_in_secs = retry_in.as_secs(),
                    "Background refresh failed, will retry"
                );
                self.arm(retry_in);
            }
            Err(
                e @ Error::Refresh {
                    kind: RefreshFailure::Rejected(_),
                    ..
                },
            ) => warn!(deployment = %self.deployment, error = %e, "Background refresh rejected by server"),
            Err(e) => debug!(deployment = %self.deployment, error = %e, "Background refresh stopped"),
        }
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    fn cancel_timer(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.handle.abort();
        }
    }

    /// Arm the proactive refresh timer for the current record
    fn schedule(self: &Arc<Self>) {
        let record = self.record.read().clone();
        let Some(record) = record.filter(|r| r.refresh_token.is_some()) else {
            self.cancel_timer();
            return;
        };
        let delay = refresh_delay(&record, self.settings.refresh_threshold, Utc::now());
        self.arm(delay);
    }

    /// Replace any armed timer with one firing after `delay`
    fn arm(self: &Arc<Self>, delay: Duration) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let refreshable = self
            .record
            .read()
            .as_ref()
            .is_some_and(|r| r.refresh_token.is_some());
        if !refreshable {
            self.cancel_timer();
            return;
        }

        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let weak: Weak<Self> = Arc::downgrade(self);

        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut timer = inner.timer.lock();
                if timer.as_ref().is_some_and(|t| t.id == id) {
                    // Detach: the refresh below re-arms
                    drop(timer.take());
                }
            }
            debug!(deployment = %inner.deployment, "Refresh timer fired");
            inner.background_refresh(false).await;
        });
        *timer = Some(ScheduledRefresh { id, due, handle });
        debug!(
            deployment = %self.deployment,
            delay_secs = delay.as_secs(),
            "Scheduled proactive refresh"
        );
    }
}

/// Classify a failed token-endpoint response to a refresh request
fn classify_refresh_failure(status: StatusCode, body: &[u8]) -> Error {
    let Some(oauth) = OAuthErrorBody::from_slice(body) else {
        return Error::refresh(RefreshFailure::Transient, format!("HTTP {status}"));
    };
    let kind = if oauth.error.requires_reauthentication() {
        RefreshFailure::ReauthRequired(oauth.error.clone())
    } else if oauth.error.is_transient() || status.is_server_error() {
        RefreshFailure::Transient
    } else {
        RefreshFailure::Rejected(oauth.error.clone())
    };
    Error::refresh(kind, format!("HTTP {status} - {oauth}"))
}

async fn watch_store(weak: Weak<Inner>, mut subscription: StoreSubscription) {
    while subscription.changed().await {
        let Some(inner) = weak.upgrade() else { break };
        if inner.disposed.load(Ordering::SeqCst) {
            break;
        }
        inner.reload().await;
    }
}
