//! Interfaces to the interactive layer
//!
//! The session layer never draws UI itself. It asks a browser opener to show
//! the authorization page, tells a prompt when the user has to log in again,
//! and, outside OAuth mode, asks an auth-required handler for a new session
//! token.

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::deployment::Deployment;
use crate::{Error, Result};

/// Opens the authorization URL for the user
pub trait BrowserOpener: Send + Sync {
    /// Show `url` to the user
    fn open(&self, url: &Url) -> Result<()>;
}

/// Opens URLs with the platform's default browser
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        info!(url = %url, "Opening browser for authorization");
        open::that(url.as_str()).map_err(|e| {
            warn!(error = %e, "Failed to open browser automatically");
            eprintln!("\nPlease authorize this client by visiting:\n{url}\n");
            Error::Internal(format!("Failed to open browser: {e}"))
        })
    }
}

/// Notified when stored credentials became permanently unusable
#[async_trait]
pub trait ReauthPrompt: Send + Sync {
    /// Ask the user to log in again. Called at most once per burst of failures.
    async fn reauthentication_required(&self, deployment: &Deployment, reason: &str);
}

/// Prompt that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReauthPrompt;

#[async_trait]
impl ReauthPrompt for LogReauthPrompt {
    async fn reauthentication_required(&self, deployment: &Deployment, reason: &str) {
        warn!(deployment = %deployment, reason, "Re-authentication required; run `login` again");
    }
}

/// Interactive re-authentication used when OAuth is not the active mode
#[async_trait]
pub trait AuthRequiredHandler: Send + Sync {
    /// Obtain a fresh session token, or `None` if the user declined
    async fn authentication_required(&self, deployment: &Deployment) -> Option<String>;
}
