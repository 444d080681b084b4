//! 401 retry interceptor
//!
//! [`RetryInterceptor`] wraps one request/response exchange. A 401 on a
//! request that has not been retried yet refreshes the credentials and resends
//! the request exactly once; a 401 on the resent request goes back to the
//! caller untouched.
//!
//! [`AuthenticatedClient`] is the outbound pipeline. The interceptor is
//! attached only while the manager holds a token, driven by its presence
//! channel. While detached the pipeline sends a plain session token and
//! escalates a 401 to the [`AuthRequiredHandler`], sharing one escalation
//! among concurrent requests.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::{HeaderName, HeaderValue, StatusCode};
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, Request, Response, ResponseBuilderExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::collaborators::AuthRequiredHandler;
use super::errors::OAuthErrorBody;
use super::manager::TokenLifecycleManager;
use super::single_flight::SingleFlight;
use crate::deployment::Deployment;
use crate::{Error, Result};

/// Default session-token header
pub const DEFAULT_SESSION_HEADER: &str = "X-Session-Token";

/// Sends a request without any authentication logic
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Execute `request`
    async fn execute(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl HttpTransport for Client {
    async fn execute(&self, request: Request) -> Result<Response> {
        Client::execute(self, request).await.map_err(Error::from)
    }
}

/// A request plus its retry marker
#[derive(Debug)]
pub struct OutboundRequest {
    /// The request
    pub request: Request,
    /// Set once the request has been resent after a 401
    pub retried: bool,
}

impl OutboundRequest {
    /// Wrap a request that has not been retried
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request,
            retried: false,
        }
    }
}

fn header_value(token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(token)
        .map_err(|e| Error::Internal(format!("Session token is not a valid header value: {e}")))
}

/// Refresh-and-retry-once around a single exchange
pub struct RetryInterceptor {
    manager: TokenLifecycleManager,
    header: HeaderName,
}

impl RetryInterceptor {
    /// Interceptor writing the access token into `session_header`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `session_header` is not a valid header name.
    pub fn new(manager: TokenLifecycleManager, session_header: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(session_header.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid session header {session_header}: {e}")))?;
        Ok(Self { manager, header })
    }

    /// Manager supplying the tokens
    pub fn manager(&self) -> &TokenLifecycleManager {
        &self.manager
    }

    /// Execute `outbound` through `transport`
    ///
    /// Transport errors are returned as errors; every HTTP response, including
    /// a final 401, is returned as a response.
    pub async fn execute(
        &self,
        transport: &dyn HttpTransport,
        outbound: OutboundRequest,
    ) -> Result<Response> {
        let OutboundRequest {
            mut request,
            retried,
        } = outbound;

        let sent_token = self.manager.current_access_token();
        if let Some(token) = &sent_token {
            request.headers_mut().insert(self.header.clone(), header_value(token)?);
        }
        let resend = if retried { None } else { request.try_clone() };

        let response = transport.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED || retried {
            return self.inspect(response).await;
        }

        let Some(mut resend) = resend else {
            debug!("Request body cannot be replayed, not retrying 401");
            return Ok(response);
        };

        let Some(token) = self.replacement_token(sent_token.as_deref()).await else {
            return Ok(response);
        };

        debug!(url = %resend.url(), "Retrying request once after 401");
        resend.headers_mut().insert(self.header.clone(), header_value(&token)?);
        let retried_response = transport.execute(resend).await?;
        if retried_response.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %retried_response.url(), "Request still unauthorized after refresh");
        }
        self.inspect(retried_response).await
    }

    /// Token to resend with, or `None` to surface the 401
    async fn replacement_token(&self, sent: Option<&str>) -> Option<String> {
        // Another path may have refreshed while the request was in flight
        let current = self.manager.current_access_token();
        if let Some(current) = current {
            if sent != Some(current.as_str()) {
                debug!("Retrying with token refreshed since the request was sent");
                return Some(current);
            }
        }

        match self.manager.refresh().await {
            Ok(record) => Some(record.access_token),
            Err(e) => {
                warn!(error = %e, "Refresh after 401 failed");
                None
            }
        }
    }

    /// Post-process a response that will not be retried
    async fn inspect(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            if self.manager.should_refresh() {
                debug!("Token close to expiry, refreshing in background");
                self.manager.refresh_in_background();
            }
            return Ok(response);
        }
        if status != StatusCode::BAD_REQUEST && status != StatusCode::FORBIDDEN {
            return Ok(response);
        }

        let (parts, body) = split_response(response).await?;
        if let Some(oauth) = OAuthErrorBody::from_slice(&body) {
            if oauth.error.requires_reauthentication() {
                info!(error = %oauth, "Server rejected credentials, re-authentication required");
                self.manager.require_reauthentication(&oauth.to_string()).await;
            }
        }
        Ok(rebuild_response(parts, body))
    }
}

/// Read a response body while keeping its head, extensions and final URL
async fn split_response(response: Response) -> Result<(http::response::Parts, Bytes)> {
    let url = response.url().clone();
    let (mut parts, body) = http::Response::<reqwest::Body>::from(response).into_parts();
    let body = Response::from(http::Response::new(body)).bytes().await?;

    // The URL is not part of the http head and is carried as an extension
    let (tagged, ()) = http::Response::builder()
        .url(url)
        .body(())
        .map_err(|e| Error::Internal(format!("Failed to rebuild response: {e}")))?
        .into_parts();
    parts.extensions.extend(tagged.extensions);
    Ok((parts, body))
}

fn rebuild_response(parts: http::response::Parts, body: Bytes) -> Response {
    Response::from(http::Response::from_parts(parts, body))
}

// ============================================================================
// Outbound pipeline
// ============================================================================

/// Authentication mode of the pipeline
enum Mode {
    Detached,
    Attached(Arc<RetryInterceptor>),
}

struct PipelineInner {
    transport: Arc<dyn HttpTransport>,
    deployment: Deployment,
    header: HeaderName,
    mode: RwLock<Mode>,
    session_token: RwLock<Option<String>>,
    auth_required: Option<Arc<dyn AuthRequiredHandler>>,
    escalation: SingleFlight<Option<String>>,
    binding: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineInner {
    fn attach(&self, interceptor: &Arc<RetryInterceptor>) {
        let mut mode = self.mode.write();
        if let Mode::Attached(current) = &*mode {
            if Arc::ptr_eq(current, interceptor) {
                return;
            }
        }
        debug!(deployment = %self.deployment, "Attaching OAuth retry interceptor");
        *mode = Mode::Attached(Arc::clone(interceptor));
    }

    fn detach(&self) {
        let mut mode = self.mode.write();
        if matches!(*mode, Mode::Attached(_)) {
            debug!(deployment = %self.deployment, "Detaching OAuth retry interceptor");
            *mode = Mode::Detached;
        }
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.abort();
        }
    }
}

/// Outbound HTTP pipeline for one deployment
#[derive(Clone)]
pub struct AuthenticatedClient {
    inner: Arc<PipelineInner>,
}

impl AuthenticatedClient {
    /// Create a detached pipeline
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `session_header` is not a valid header name.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        deployment: Deployment,
        session_header: &str,
        auth_required: Option<Arc<dyn AuthRequiredHandler>>,
    ) -> Result<Self> {
        let header = HeaderName::from_bytes(session_header.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid session header {session_header}: {e}")))?;
        Ok(Self {
            inner: Arc::new(PipelineInner {
                transport,
                deployment,
                header,
                mode: RwLock::new(Mode::Detached),
                session_token: RwLock::new(None),
                auth_required,
                escalation: SingleFlight::new(),
                binding: Mutex::new(None),
            }),
        })
    }

    /// Attach and detach the interceptor as `manager` gains and loses a token
    ///
    /// Replaces any earlier binding.
    pub fn bind(&self, manager: &TokenLifecycleManager) -> Result<()> {
        let interceptor = Arc::new(RetryInterceptor::new(
            manager.clone(),
            self.inner.header.as_str(),
        )?);
        let mut presence = manager.subscribe_presence();
        if *presence.borrow_and_update() {
            self.inner.attach(&interceptor);
        } else {
            self.inner.detach();
        }

        let weak: Weak<PipelineInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while presence.changed().await.is_ok() {
                let present = *presence.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                if present {
                    inner.attach(&interceptor);
                } else {
                    inner.detach();
                }
            }
        });
        if let Some(previous) = self.inner.binding.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// True while the OAuth interceptor handles requests
    pub fn is_attached(&self) -> bool {
        matches!(*self.inner.mode.read(), Mode::Attached(_))
    }

    /// Session token used while detached
    pub fn set_session_token(&self, token: Option<String>) {
        *self.inner.session_token.write() = token;
    }

    /// Send a GET for `path` relative to the deployment
    pub async fn get(&self, path: &str) -> Result<Response> {
        let url = self.inner.deployment.join(path)?;
        self.send(Request::new(reqwest::Method::GET, url)).await
    }

    /// Send a request through the pipeline
    pub async fn send(&self, request: Request) -> Result<Response> {
        let interceptor = match &*self.inner.mode.read() {
            Mode::Attached(interceptor) => Some(Arc::clone(interceptor)),
            Mode::Detached => None,
        };
        match interceptor {
            Some(interceptor) => {
                interceptor
                    .execute(self.inner.transport.as_ref(), OutboundRequest::new(request))
                    .await
            }
            None => self.send_detached(request).await,
        }
    }

    async fn send_detached(&self, mut request: Request) -> Result<Response> {
        let inner = &self.inner;
        let token = inner.session_token.read().clone();
        if let Some(token) = &token {
            request.headers_mut().insert(inner.header.clone(), header_value(token)?);
        }
        let resend = request.try_clone();
        let response = inner.transport.execute(request).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let (Some(handler), Some(mut resend)) = (inner.auth_required.clone(), resend) else {
            return Ok(response);
        };

        let deployment = inner.deployment.clone();
        let escalation = inner
            .escalation
            .run(move || async move { handler.authentication_required(&deployment).await }.boxed());
        let Some(token) = escalation.await else {
            debug!("Authentication declined");
            return Ok(response);
        };

        *inner.session_token.write() = Some(token.clone());
        resend.headers_mut().insert(inner.header.clone(), header_value(&token)?);
        inner.transport.execute(resend).await
    }
}
