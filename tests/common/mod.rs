//! Mock authorization server and API shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use parking_lot::Mutex;
use remote_oauth::Deployment;
use remote_oauth::oauth::{
    ClientRegistration, CredentialStore, InMemoryCredentialStore, ManagerOptions, OAuthSettings,
    ReauthPrompt, StoreKeys, TokenEndpointAuthMethod, TokenLifecycleManager, TokenRecord,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const SCOPE: &str = "user:read";

/// Everything the mock server observed and how it should answer
#[derive(Default)]
pub struct MockState {
    pub base: String,
    pub token_calls: AtomicUsize,
    pub token_forms: Mutex<Vec<HashMap<String, String>>>,
    pub token_delay: Mutex<Duration>,
    pub token_error: Mutex<Option<String>>,
    pub expires_in: AtomicU64,
    pub issued: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub registered_redirects: Mutex<Vec<String>>,
    pub revoke_calls: AtomicUsize,
    pub revoke_forms: Mutex<Vec<HashMap<String, String>>>,
    pub api_calls: AtomicUsize,
    pub api_tokens: Mutex<Vec<Option<String>>>,
    pub valid_token: Mutex<Option<String>>,
    pub api_reject_all: AtomicBool,
    /// Refresh tokens are single use; a replayed one fails with `invalid_grant`
    pub rotate: AtomicBool,
    pub used_refresh: Mutex<HashSet<String>>,
    /// Scope returned in place of the full grant
    pub scope_override: Mutex<Option<String>>,
}

pub struct MockServer {
    pub base: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(MockState {
            base: base.clone(),
            expires_in: AtomicU64::new(3600),
            ..Default::default()
        });

        let app = Router::new()
            .route("/.well-known/oauth-authorization-server", get(metadata))
            .route("/register", post(register))
            .route("/token", post(token))
            .route("/revoke", post(revoke))
            .route("/api/me", get(api_me))
            .route("/api/forbidden", get(api_forbidden))
            .with_state(Arc::clone(&state));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    pub fn deployment(&self) -> Deployment {
        Deployment::new(&self.base).unwrap()
    }

    pub fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    pub fn api_calls(&self) -> usize {
        self.state.api_calls.load(Ordering::SeqCst)
    }

    pub fn set_valid_token(&self, token: &str) {
        *self.state.valid_token.lock() = Some(token.to_string());
    }
}

async fn metadata(State(s): State<Arc<MockState>>) -> Json<Value> {
    Json(json!({
        "issuer": s.base,
        "authorization_endpoint": format!("{}/authorize", s.base),
        "token_endpoint": format!("{}/token", s.base),
        "registration_endpoint": format!("{}/register", s.base),
        "revocation_endpoint": format!("{}/revoke", s.base),
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "response_types_supported": ["code"],
        "token_endpoint_auth_methods_supported": ["none", "client_secret_post", "client_secret_basic"],
        "code_challenge_methods_supported": ["S256"],
        "scopes_supported": ["user:read", "workspace:*"]
    }))
}

async fn register(State(s): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    s.register_calls.fetch_add(1, Ordering::SeqCst);
    let redirects: Vec<String> = body["redirect_uris"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    s.registered_redirects.lock().extend(redirects.iter().cloned());
    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": "client-1",
            "client_secret": "secret-1",
            "redirect_uris": redirects,
            "grant_types": ["authorization_code", "refresh_token"]
        })),
    )
        .into_response()
}

async fn token(State(s): State<Arc<MockState>>, Form(form): Form<HashMap<String, String>>) -> Response {
    s.token_calls.fetch_add(1, Ordering::SeqCst);
    let replayed = s.rotate.load(Ordering::SeqCst)
        && form.get("grant_type").map(String::as_str) == Some("refresh_token")
        && form
            .get("refresh_token")
            .is_some_and(|t| !s.used_refresh.lock().insert(t.clone()));
    s.token_forms.lock().push(form);

    if replayed {
        // Answer late so the winning request has already been persisted
        tokio::time::sleep(Duration::from_millis(200)).await;
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "refresh token reused"})),
        )
            .into_response();
    }

    let delay = *s.token_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let error = s.token_error.lock().clone();
    if let Some(code) = error {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": code, "error_description": "rejected by mock"})),
        )
            .into_response();
    }

    let n = s.issued.fetch_add(1, Ordering::SeqCst) + 1;
    let access = format!("access-{n}");
    *s.valid_token.lock() = Some(access.clone());
    let scope = s
        .scope_override
        .lock()
        .clone()
        .unwrap_or_else(|| "user:read workspace:*".to_string());
    Json(json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": s.expires_in.load(Ordering::SeqCst),
        "refresh_token": format!("refresh-{n}"),
        "scope": scope
    }))
    .into_response()
}

async fn revoke(State(s): State<Arc<MockState>>, Form(form): Form<HashMap<String, String>>) -> StatusCode {
    s.revoke_calls.fetch_add(1, Ordering::SeqCst);
    s.revoke_forms.lock().push(form);
    StatusCode::OK
}

async fn api_me(State(s): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    s.api_calls.fetch_add(1, Ordering::SeqCst);
    let sent = headers
        .get("x-session-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    s.api_tokens.lock().push(sent.clone());

    let valid = s.valid_token.lock().clone();
    if s.api_reject_all.load(Ordering::SeqCst) || sent.is_none() || sent != valid {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (StatusCode::OK, "ok").into_response()
}

async fn api_forbidden(State(s): State<Arc<MockState>>) -> Response {
    s.api_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "invalid_grant", "error_description": "grant revoked"})),
    )
        .into_response()
}

// ============================================================================
// Client-side helpers
// ============================================================================

pub fn settings() -> OAuthSettings {
    OAuthSettings {
        scopes: vec![SCOPE.to_string()],
        auth_method: TokenEndpointAuthMethod::ClientSecretPost,
        ..Default::default()
    }
}

pub fn record(access: &str, expires_in_secs: i64) -> TokenRecord {
    TokenRecord {
        access_token: access.to_string(),
        token_type: "Bearer".to_string(),
        refresh_token: Some("refresh-0".to_string()),
        scope: Some(SCOPE.to_string()),
        expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
    }
}

/// Store a registration and token as a previous login would have
pub async fn seed(store: &InMemoryCredentialStore, deployment: &Deployment, record: &TokenRecord) {
    let keys = StoreKeys::new(deployment.stable_identifier());
    let registration = ClientRegistration {
        client_id: "client-1".to_string(),
        client_secret: Some("secret-1".to_string()),
        redirect_uris: vec![settings().redirect_uri],
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
    };
    store
        .set(&keys.client_registration(), &serde_json::to_string(&registration).unwrap())
        .await
        .unwrap();
    store
        .set(&keys.token_metadata(), &serde_json::to_string(record).unwrap())
        .await
        .unwrap();
}

#[derive(Default)]
pub struct CountingPrompt {
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ReauthPrompt for CountingPrompt {
    async fn reauthentication_required(&self, _deployment: &Deployment, _reason: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub async fn manager(
    server: &MockServer,
    store: &InMemoryCredentialStore,
    prompt: Option<Arc<CountingPrompt>>,
) -> TokenLifecycleManager {
    manager_with(server, store, settings(), prompt).await
}

pub async fn manager_with(
    server: &MockServer,
    store: &InMemoryCredentialStore,
    settings: OAuthSettings,
    prompt: Option<Arc<CountingPrompt>>,
) -> TokenLifecycleManager {
    let mut options = ManagerOptions::new(settings, reqwest::Client::new());
    if let Some(prompt) = prompt {
        options = options.with_reauth_prompt(prompt);
    }
    TokenLifecycleManager::create(server.deployment(), Arc::new(store.clone()), options)
        .await
        .unwrap()
}

/// Poll `condition` for up to five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
