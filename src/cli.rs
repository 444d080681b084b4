//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth session manager for remote-development deployments
#[derive(Parser, Debug)]
#[command(name = "remote-oauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "REMOTE_OAUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "REMOTE_OAUTH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "REMOTE_OAUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in through the browser
    Login {
        /// Deployment URL
        url: String,
    },

    /// Revoke and forget stored credentials
    Logout {
        /// Deployment URL
        url: String,
    },

    /// Show the stored session
    Status {
        /// Deployment URL
        url: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Refresh the access token now
    Refresh {
        /// Deployment URL
        url: String,
    },

    /// Send an authenticated GET request
    Request {
        /// Deployment URL
        url: String,

        /// Path relative to the deployment (e.g. /api/v2/users/me)
        path: String,
    },
}

impl Command {
    /// Deployment URL the command targets
    #[must_use]
    pub fn deployment_url(&self) -> &str {
        match self {
            Self::Login { url }
            | Self::Logout { url }
            | Self::Status { url, .. }
            | Self::Refresh { url }
            | Self::Request { url, .. } => url,
        }
    }
}
