//! OAuth 2.1 session layer
//!
//! Implements the client side of the OAuth authorization-code flow with PKCE
//! (RFC 7636) for a remote-development server, and keeps the resulting
//! session alive across every client process that shares the credential
//! store.
//!
//! Features:
//! - Authorization server metadata discovery and validation (RFC 8414)
//! - Dynamic client registration (RFC 7591)
//! - Authorization code flow with PKCE and a loopback callback server
//! - Proactive, single-flight, throttled token refresh
//! - 401 retry-once interceptor
//! - Cross-process convergence through store change notifications
//! - Best-effort token revocation (RFC 7009)

mod authorization;
mod callback;
mod collaborators;
mod errors;
mod interceptor;
mod manager;
mod metadata;
mod registration;
mod single_flight;
mod storage;
mod token;

pub use authorization::{
    AuthorizationCoordinator, AuthorizationGrant, AuthorizationRequest, CallbackOutcome,
    DEFAULT_AUTHORIZATION_TIMEOUT, PkcePair, build_authorization_url, generate_pkce,
    generate_state, pkce_challenge,
};
pub use callback::{CALLBACK_PATH, CallbackParams, CallbackServer};
pub use collaborators::{
    AuthRequiredHandler, BrowserOpener, LogReauthPrompt, ReauthPrompt, SystemBrowser,
};
pub use errors::{OAuthErrorBody, OAuthErrorCode};
pub use interceptor::{
    AuthenticatedClient, DEFAULT_SESSION_HEADER, HttpTransport, OutboundRequest, RetryInterceptor,
};
pub use manager::{ManagerOptions, OAuthSettings, SessionState, SessionStatus, TokenLifecycleManager};
pub use metadata::{AuthorizationServerMetadata, DISCOVERY_PATH, MetadataClient};
pub use registration::{ClientRegistration, ClientRegistry, TokenEndpointAuthMethod};
pub use single_flight::{Flight, SingleFlight};
pub use storage::{
    CredentialStore, FileCredentialStore, InMemoryCredentialStore, StoreKeys, StoreSubscription,
    default_directory,
};
pub use token::{MAX_TOKEN_LIFETIME, TokenRecord, TokenResponse, refresh_delay, scope_is_covered};
