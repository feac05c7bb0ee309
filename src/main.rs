mod auth;
mod config;
mod git;
mod ssh;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::CredentialVerifier;
use crate::config::Config;
use crate::git::{AllowedVerbs, ExecPolicy};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "SSH gateway for git pack-protocol requests")]
struct Cli {
    /// Path to a YAML configuration file.  Built-in defaults apply when
    /// omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every connection and channel task.
pub struct AppState {
    pub config: Arc<Config>,
    pub policy: ExecPolicy,
    pub verifier: Arc<dyn CredentialVerifier>,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref())?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting gitgate");

    // ---- Repository root ----
    tokio::fs::create_dir_all(&config.repo_root)
        .await
        .with_context(|| {
            format!(
                "failed to create repository root: {}",
                config.repo_root.display()
            )
        })?;
    let repo_root = tokio::fs::canonicalize(&config.repo_root)
        .await
        .with_context(|| {
            format!(
                "failed to resolve repository root: {}",
                config.repo_root.display()
            )
        })?;

    // ---- Auth ----
    let verifier = auth::build_verifier(&config.auth)?;
    if verifier.accepts_anonymous() {
        tracing::warn!("client authentication is disabled; every client is admitted");
    }

    // ---- App state ----
    let policy = ExecPolicy::new(
        AllowedVerbs::pack_protocol(),
        &repo_root,
        config.access.read_only,
    );
    tracing::info!(
        repo_root = %policy.repo_root().display(),
        read_only = config.access.read_only,
        "repository policy ready"
    );

    let state = Arc::new(AppState {
        config: Arc::new(config),
        policy,
        verifier,
    });

    // ---- Serve until signalled ----
    tokio::select! {
        result = ssh::start_ssh_server(state) => {
            result.context("SSH server failed")?;
        }
        () = shutdown_signal() => {}
    }

    tracing::info!("gitgate shut down");
    Ok(())
}
