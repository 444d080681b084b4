//! Authorization-code flow with PKCE (RFC 7636)
//!
//! The coordinator owns at most one pending flow. Starting a new flow rejects
//! the previous one; the flow settles exactly once, on the first callback,
//! the deadline, or cancellation.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::callback::CallbackParams;
use super::collaborators::BrowserOpener;
use super::metadata::AuthorizationServerMetadata;
use super::registration::ClientRegistration;
use crate::error::AuthorizationFailure;
use crate::{Error, Result};

/// Default wait for the user to finish in the browser
pub const DEFAULT_AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// PKCE verifier and S256 challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Code verifier (43 base64url characters, 256 bits of entropy)
    pub verifier: String,
    /// `base64url(sha256(verifier))`
    pub challenge: String,
}

/// Generate PKCE code verifier and challenge
#[must_use]
pub fn generate_pkce() -> PkcePair {
    let verifier_bytes: [u8; 32] = rand::random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = pkce_challenge(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

/// S256 challenge for a verifier
#[must_use]
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Generate a random state parameter (128 bits)
#[must_use]
pub fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Result of a successful authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationGrant {
    /// Authorization code
    pub code: String,
    /// PKCE verifier matching the challenge that was sent
    pub verifier: String,
    /// Redirect URI used in the authorization request
    pub redirect_uri: String,
}

/// What [`AuthorizationCoordinator::handle_callback`] did with a callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The pending flow was resolved with a code
    Accepted,
    /// The pending flow was rejected
    Rejected(AuthorizationFailure),
    /// No flow was pending
    Ignored,
}

struct PendingAuthorization {
    state: String,
    tx: oneshot::Sender<Result<String>>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl PendingAuthorization {
    fn settle(self, outcome: Result<String>) {
        // The waiter may already be gone (timed out or cancelled)
        let _ = self.tx.send(outcome);
    }
}

/// Inputs of one authorization request
pub struct AuthorizationRequest<'a> {
    /// Discovered server metadata
    pub metadata: &'a AuthorizationServerMetadata,
    /// Client registration to authorize
    pub registration: &'a ClientRegistration,
    /// Redirect URI registered for the client
    pub redirect_uri: &'a str,
    /// Scopes to request
    pub scopes: &'a [String],
}

/// Drives one PKCE authorization-code exchange at a time
pub struct AuthorizationCoordinator {
    pending: Mutex<Option<PendingAuthorization>>,
    browser: Arc<dyn BrowserOpener>,
    timeout: Duration,
}

impl AuthorizationCoordinator {
    /// Create a coordinator that shows URLs through `browser`
    #[must_use]
    pub fn new(browser: Arc<dyn BrowserOpener>, timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(None),
            browser,
            timeout,
        }
    }

    /// True while a flow waits for its callback
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Deadline of the pending flow
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending.lock().as_ref().map(|p| p.deadline)
    }

    /// Run the browser part of the flow and wait for the callback
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authorization`] on denial, state mismatch, timeout,
    /// cancellation, or when a newer flow supersedes this one.
    pub async fn authorize(&self, request: AuthorizationRequest<'_>) -> Result<AuthorizationGrant> {
        let pkce = generate_pkce();
        let state = generate_state();
        let url = build_authorization_url(&request, &state, &pkce.challenge)?;

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + self.timeout;

        {
            let mut pending = self.pending.lock();
            if let Some(previous) = pending.take() {
                debug!("Replacing pending authorization flow");
                previous.settle(Err(Error::Authorization(AuthorizationFailure::Superseded)));
            }
            *pending = Some(PendingAuthorization {
                state: state.clone(),
                tx,
                cancel: cancel.clone(),
                deadline,
            });
        }

        if let Err(e) = self.browser.open(&url) {
            // The user can still open the URL by hand
            warn!(error = %e, "Browser collaborator failed");
        }

        let outcome = tokio::select! {
            received = rx => received
                .unwrap_or(Err(Error::Authorization(AuthorizationFailure::Cancelled))),
            () = tokio::time::sleep_until(deadline) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Authorization timed out");
                Err(Error::Authorization(AuthorizationFailure::TimedOut))
            }
            () = cancel.cancelled() => Err(Error::Authorization(AuthorizationFailure::Cancelled)),
        };

        self.clear_if(&state);

        let code = outcome?;
        info!("Received authorization code");
        Ok(AuthorizationGrant {
            code,
            verifier: pkce.verifier,
            redirect_uri: request.redirect_uri.to_string(),
        })
    }

    /// Deliver a redirect callback to the pending flow
    pub fn handle_callback(&self, params: &CallbackParams) -> CallbackOutcome {
        let Some(pending) = self.pending.lock().take() else {
            debug!("Callback received with no pending authorization, ignoring");
            return CallbackOutcome::Ignored;
        };

        let state_matches = params.state.as_deref().is_some_and(|s| {
            s.len() == pending.state.len() && bool::from(s.as_bytes().ct_eq(pending.state.as_bytes()))
        });
        if !state_matches {
            warn!("Authorization callback state mismatch");
            return reject(pending, AuthorizationFailure::StateMismatch);
        }

        if let Some(error) = &params.error {
            return reject(
                pending,
                AuthorizationFailure::Denied {
                    error: error.clone(),
                    description: params.error_description.clone(),
                },
            );
        }

        match params.code.as_deref() {
            Some(code) if !code.is_empty() => {
                pending.settle(Ok(code.to_string()));
                CallbackOutcome::Accepted
            }
            _ => reject(pending, AuthorizationFailure::MissingCode),
        }
    }

    /// Reject the pending flow, if any, as cancelled
    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            debug!("Cancelling pending authorization");
            pending.cancel.cancel();
            pending.settle(Err(Error::Authorization(AuthorizationFailure::Cancelled)));
        }
    }

    fn clear_if(&self, state: &str) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.state == state) {
            *pending = None;
        }
    }
}

fn reject(pending: PendingAuthorization, failure: AuthorizationFailure) -> CallbackOutcome {
    pending.settle(Err(Error::Authorization(failure.clone())));
    CallbackOutcome::Rejected(failure)
}

/// Build the authorization request URL
///
/// # Errors
///
/// Returns [`Error::Discovery`] if the authorization endpoint is not a valid URL.
pub fn build_authorization_url(
    request: &AuthorizationRequest<'_>,
    state: &str,
    code_challenge: &str,
) -> Result<Url> {
    let mut auth_url = Url::parse(&request.metadata.authorization_endpoint)
        .map_err(|e| Error::Discovery(format!("Invalid auth endpoint: {e}")))?;

    {
        let mut params = auth_url.query_pairs_mut();
        params.append_pair("client_id", &request.registration.client_id);
        params.append_pair("response_type", "code");
        params.append_pair("redirect_uri", request.redirect_uri);
        if !request.scopes.is_empty() {
            params.append_pair("scope", &request.scopes.join(" "));
        }
        params.append_pair("state", state);
        params.append_pair("code_challenge", code_challenge);
        params.append_pair("code_challenge_method", "S256");
    }

    Ok(auth_url)
}
