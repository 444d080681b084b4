//! Remote OAuth Library
//!
//! Client-side OAuth 2.1 session layer for remote-development clients.
//!
//! # Features
//!
//! - **Discovery & Registration**: RFC 8414 metadata validation and RFC 7591 dynamic clients
//! - **PKCE Login**: authorization-code flow with a loopback callback server
//! - **Token Lifecycle**: proactive, single-flight, throttled refresh
//! - **Retry Interceptor**: one refresh-and-retry per 401
//! - **Cross-Window Sync**: processes converge through a shared credential store

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod deployment;
pub mod error;
pub mod oauth;

pub use deployment::Deployment;
pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level`. Logs go to stderr so command output on
/// stdout stays machine readable.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to initialize tracing: {e}")))
}
