//! SSH listener: host key bootstrap, russh configuration and the accept loop.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::session::SshSession;
use crate::AppState;

/// Pause after a failed `accept` so a persistent error (e.g. EMFILE) does
/// not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the host key from `path`, generating and persisting a fresh Ed25519
/// key there if the file does not exist yet.
async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create host key dir: {}", parent.display()))?;
    }

    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;
    write_private_file(path, &pem)
        .await
        .with_context(|| format!("failed to write SSH host key: {}", path.display()))?;

    info!(path = %path.display(), "generated new Ed25519 SSH host key");
    Ok(key)
}

/// Create `path` readable by the owner only and write `contents`.  Fails if
/// the file already exists.
async fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

// ---------------------------------------------------------------------------
// russh config
// ---------------------------------------------------------------------------

fn build_config(state: &AppState, host_key: KeyPair) -> server::Config {
    let mut methods = MethodSet::PUBLICKEY;
    if state.verifier.accepts_anonymous() {
        methods |= MethodSet::NONE;
    }

    server::Config {
        keys: vec![host_key],
        methods,
        inactivity_timeout: state
            .config
            .limits
            .inactivity_timeout_secs
            .map(Duration::from_secs),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Run one connection from handshake to disconnect.
#[instrument(skip_all, fields(peer = %peer_addr))]
async fn negotiate(
    config: Arc<server::Config>,
    state: Arc<AppState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    debug!("SSH handshake starting");
    let handler = SshSession::new(state, Some(peer_addr));

    let session = match server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            log_session_end(&e, "SSH handshake failed");
            return;
        }
    };

    match session.await {
        Ok(()) => debug!("SSH session closed"),
        Err(e) => log_session_end(&e, "SSH session ended with error"),
    }
}

fn log_session_end(error: &anyhow::Error, message: &str) {
    if is_peer_disconnect(error) {
        debug!(error = %error, "peer closed the connection");
    } else {
        warn!(error = %error, "{message}");
    }
}

fn is_peer_disconnect(error: &anyhow::Error) -> bool {
    let io_eof = |e: &std::io::Error| e.kind() == std::io::ErrorKind::UnexpectedEof;
    match error.downcast_ref::<russh::Error>() {
        Some(russh::Error::Disconnect) => true,
        Some(russh::Error::IO(e)) => io_eof(e),
        Some(_) => false,
        None => error.downcast_ref::<std::io::Error>().is_some_and(io_eof),
    }
}

/// Accept connections forever, one task per connection.
///
/// Accept errors are logged and the loop carries on.  Connections beyond
/// `limits.max_connections` are dropped right after accept.
async fn serve(
    listener: TcpListener,
    config: Arc<server::Config>,
    state: Arc<AppState>,
) -> Result<()> {
    let connection_slots = Arc::new(Semaphore::new(state.config.limits.max_connections));

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept SSH connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&connection_slots).try_acquire_owned() else {
            warn!(
                peer = %peer_addr,
                limit = state.config.limits.max_connections,
                "connection limit reached; dropping connection"
            );
            continue;
        };

        info!(peer = %peer_addr, "accepted SSH connection");
        let config = Arc::clone(&config);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            negotiate(config, state, stream, peer_addr).await;
            drop(permit);
        });
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  Returns only if startup fails; bind errors are
/// reported to the caller.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let host_key = load_or_generate_host_key(&state.config.host_key_path).await?;
    let config = Arc::new(build_config(&state, host_key));

    let listen_addr = state.config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;

    info!(address = %listen_addr, "SSH server listening");
    serve(listener, config, state).await
}
