//! remote-oauth - OAuth session manager for remote-development deployments

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use remote_oauth::{
    Deployment, Result,
    cli::{Cli, Command},
    config::{Config, StoreKind},
    oauth::{
        AuthenticatedClient, CallbackServer, CredentialStore, FileCredentialStore,
        InMemoryCredentialStore, ManagerOptions, TokenLifecycleManager,
    },
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    Ok(match config.store.kind {
        StoreKind::File => Arc::new(FileCredentialStore::new(config.store.resolved_directory()?)?),
        StoreKind::Memory => Arc::new(InMemoryCredentialStore::new()),
    })
}

async fn run(config: &Config, command: Command) -> Result<()> {
    let deployment = Deployment::new(command.deployment_url())?;
    let http_client = config.http_client()?;
    let manager = TokenLifecycleManager::create(
        deployment.clone(),
        open_store(config)?,
        ManagerOptions::new(config.oauth.settings(), http_client.clone()),
    )
    .await?;

    let outcome = match command {
        Command::Login { .. } => login(&manager).await,
        Command::Logout { .. } => manager.logout().await.map(|()| println!("Logged out of {deployment}")),
        Command::Status { json, .. } => status(&manager, json),
        Command::Refresh { .. } => manager.refresh().await.map(|record| {
            println!("Token refreshed, expires at {}", record.expires_at);
        }),
        Command::Request { path, .. } => request(config, &manager, http_client, &path).await,
    };

    manager.dispose().await;
    outcome
}

async fn login(manager: &TokenLifecycleManager) -> Result<()> {
    let server = CallbackServer::bind(&manager.settings().redirect_uri, manager.coordinator()).await?;
    info!(redirect_uri = %server.redirect_uri(), "Waiting for authorization");

    let outcome = manager.login_with_redirect_uri(server.redirect_uri()).await;
    server.shutdown().await;

    let record = outcome?;
    println!("Logged in to {}", manager.deployment());
    println!("  Scope:      {}", record.scope.as_deref().unwrap_or("-"));
    println!("  Expires at: {}", record.expires_at);
    Ok(())
}

fn status(manager: &TokenLifecycleManager, json: bool) -> Result<()> {
    let status = manager.status();
    if json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|e| remote_oauth::Error::Internal(format!("Failed to render status: {e}")))?;
        println!("{rendered}");
        return Ok(());
    }

    println!("Deployment:    {}", manager.deployment());
    println!("State:         {:?}", status.state);
    match status.expires_at {
        Some(at) => println!("Expires at:    {at}"),
        None => println!("Expires at:    -"),
    }
    println!("Scope:         {}", status.scope.as_deref().unwrap_or("-"));
    println!("Refreshable:   {}", if status.has_refresh_token { "yes" } else { "no" });
    if let Some(next) = status.next_refresh_at {
        println!("Next refresh:  {next}");
    }
    Ok(())
}

async fn request(
    config: &Config,
    manager: &TokenLifecycleManager,
    http_client: reqwest::Client,
    path: &str,
) -> Result<()> {
    let client = AuthenticatedClient::new(
        Arc::new(http_client),
        manager.deployment().clone(),
        &config.oauth.session_header,
        None,
    )?;
    client.bind(manager)?;

    let response = client.get(path).await?;
    let status = response.status();
    let body = response.text().await?;
    println!("HTTP {status}");
    println!("{body}");
    if status.is_success() {
        Ok(())
    } else {
        Err(remote_oauth::Error::Http(format!("request failed with HTTP {status}")))
    }
}
