//! OAuth Callback Server
//!
//! A loopback HTTP server that receives the authorization redirect and hands
//! it to the [`AuthorizationCoordinator`]. It never decides anything itself;
//! the coordinator matches the callback against its pending flow.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::authorization::{AuthorizationCoordinator, CallbackOutcome};
use crate::error::AuthorizationFailure;
use crate::{Error, Result};

/// Fixed redirect path
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// OAuth callback query parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Extract callback parameters from a full redirect URI
    ///
    /// Used by URI-handler collaborators that receive the redirect as a URL
    /// instead of an HTTP request. Returns `None` when the path is not
    /// [`CALLBACK_PATH`].
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        if url.path() != CALLBACK_PATH {
            return None;
        }
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        Some(params)
    }
}

/// Running loopback callback server
pub struct CallbackServer {
    local_addr: SocketAddr,
    redirect_uri: String,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind to the host and port of `redirect_uri` and start serving
    ///
    /// A port of `0` binds an ephemeral port; [`Self::redirect_uri`] then
    /// reports the URI with the actual port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a redirect URI that is not a loopback
    /// `http` URL with path [`CALLBACK_PATH`], and [`Error::Internal`] when the
    /// port cannot be bound.
    pub async fn bind(redirect_uri: &str, coordinator: Arc<AuthorizationCoordinator>) -> Result<Self> {
        let mut url = Url::parse(redirect_uri)
            .map_err(|e| Error::Config(format!("Invalid redirect URI {redirect_uri}: {e}")))?;
        if url.scheme() != "http" || url.path() != CALLBACK_PATH {
            return Err(Error::Config(format!(
                "Redirect URI must be http://<loopback>:<port>{CALLBACK_PATH}, got {redirect_uri}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Redirect URI has no host: {redirect_uri}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(0);

        let addr: SocketAddr = match host.as_str() {
            "localhost" => SocketAddr::from(([127, 0, 0, 1], port)),
            other => format!("{other}:{port}")
                .parse::<SocketAddr>()
                .or_else(|_| format!("[{other}]:{port}").parse::<SocketAddr>())
                .map_err(|e| Error::Config(format!("Redirect URI host is not an IP: {e}")))?,
        };
        if !addr.ip().is_loopback() {
            return Err(Error::Config(format!(
                "Redirect URI must point at a loopback address, got {host}"
            )));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind callback server: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("Failed to get callback server address: {e}")))?;

        if port == 0 {
            // Infallible for http URLs with a host
            let _ = url.set_port(Some(local_addr.port()));
        }
        let redirect_uri = url.to_string();
        info!(url = %redirect_uri, "OAuth callback server listening");

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(coordinator);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
            {
                warn!(error = %e, "Callback server error");
            }
        });

        Ok(Self {
            local_addr,
            redirect_uri,
            shutdown,
            task: Some(task),
        })
    }

    /// Bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Redirect URI served by this server
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Stop serving and wait for the server task
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_callback(
    State(coordinator): State<Arc<AuthorizationCoordinator>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    debug!(
        has_code = params.code.is_some(),
        has_state = params.state.is_some(),
        error = ?params.error,
        "Received OAuth callback"
    );

    match coordinator.handle_callback(&params) {
        CallbackOutcome::Accepted => (StatusCode::OK, Html(success_page())),
        CallbackOutcome::Rejected(failure) => {
            let code = match &failure {
                AuthorizationFailure::Denied { error, .. } => error.clone(),
                AuthorizationFailure::StateMismatch => "state_mismatch".to_string(),
                AuthorizationFailure::MissingCode => "missing_code".to_string(),
                _ => "authorization_failed".to_string(),
            };
            (StatusCode::BAD_REQUEST, Html(error_page(&code, &failure.to_string())))
        }
        CallbackOutcome::Ignored => (
            StatusCode::CONFLICT,
            Html(error_page(
                "no_pending_authorization",
                "This sign-in link has already been used or has expired.",
            )),
        ),
    }
}

fn page(title: &str, accent: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; margin: 0; height: 100vh;
               display: flex; align-items: center; justify-content: center; background: #f5f5f5; }}
        main {{ max-width: 420px; padding: 2rem; background: white; border-radius: 8px;
               border-top: 4px solid {accent}; box-shadow: 0 2px 8px rgba(0,0,0,0.1); }}
        h1 {{ margin: 0 0 0.75rem 0; font-size: 1.4rem; }}
        code {{ color: #666; }}
    </style>
</head>
<body>
    <main>
        <h1>{title}</h1>
        {body}
    </main>
</body>
</html>"#
    )
}

fn success_page() -> String {
    page(
        "Signed in",
        "#2e7d32",
        "<p>You can close this tab and return to your editor.</p>",
    )
}

fn error_page(error: &str, description: &str) -> String {
    page(
        "Sign-in failed",
        "#c62828",
        &format!(
            "<p>{}</p>\n        <p><code>{}</code></p>",
            escape_html(description),
            escape_html(error)
        ),
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::oauth::collaborators::BrowserOpener;

    struct NoBrowser;

    impl BrowserOpener for NoBrowser {
        fn open(&self, _url: &Url) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator() -> Arc<AuthorizationCoordinator> {
        Arc::new(AuthorizationCoordinator::new(Arc::new(NoBrowser), Duration::from_secs(60)))
    }

    #[test]
    fn test_callback_params_deserialize() {
        let params: CallbackParams = serde_urlencoded::from_str("code=abc123&state=xyz789").unwrap();

        assert_eq!(params.code, Some("abc123".to_string()));
        assert_eq!(params.state, Some("xyz789".to_string()));
        assert_eq!(params.error, None);
    }

    #[test]
    fn params_from_custom_scheme_url() {
        let url = Url::parse("vscode://remote.auth/oauth/callback?code=c&state=s&extra=1").unwrap();
        let params = CallbackParams::from_url(&url).unwrap();
        assert_eq!(params.code.as_deref(), Some("c"));
        assert_eq!(params.state.as_deref(), Some("s"));
    }

    #[test]
    fn params_from_url_requires_callback_path() {
        let url = Url::parse("http://127.0.0.1:1/other?code=c").unwrap();
        assert!(CallbackParams::from_url(&url).is_none());
    }

    #[test]
    fn error_page_escapes_markup() {
        let page = error_page("<x>", "a & b");
        assert!(page.contains("&lt;x&gt;"));
        assert!(page.contains("a &amp; b"));
    }

    #[tokio::test]
    async fn rejects_non_loopback_redirect() {
        let err = CallbackServer::bind("http://10.1.2.3:8080/oauth/callback", coordinator())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_path() {
        let err = CallbackServer::bind("http://127.0.0.1:0/callback", coordinator())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn ephemeral_port_is_reported_in_redirect_uri() {
        let server = CallbackServer::bind("http://127.0.0.1:0/oauth/callback", coordinator())
            .await
            .unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(
            server.redirect_uri(),
            format!("http://127.0.0.1:{port}/oauth/callback")
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn callback_without_pending_flow_is_conflict() {
        let server = CallbackServer::bind("http://127.0.0.1:0/oauth/callback", coordinator())
            .await
            .unwrap();
        let url = format!("{}?code=c&state=s", server.redirect_uri());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
        server.shutdown().await;
    }
}
