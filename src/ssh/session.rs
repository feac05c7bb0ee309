//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! One [`SshSession`] exists per connection.  It asks the configured
//! credential verifier whether to admit the client, and hands every accepted
//! `session` channel to its own [`ChannelDispatcher`] task so that it never
//! blocks on channel content itself.
//!
//! Channel kinds other than `session` and global requests such as
//! `tcpip-forward` fall through to russh's default handler methods.  Those
//! refuse x11 and direct-tcpip channels as administratively prohibited and
//! any other unrecognised kind as an unknown channel type.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use russh_keys::key::PublicKey;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::channel::ChannelDispatcher;
use crate::auth::{fingerprint_of, Credential, Verdict};
use crate::AppState;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    /// User name the client authenticated as.
    user: Option<String>,
    /// Fingerprint of the accepted public key, if any.
    fingerprint: Option<String>,
    /// Identification banner the client sent, e.g. `SSH-2.0-OpenSSH_9.6`.
    client_version: Option<String>,
    /// Bounds the channels this session may have open at once.
    channel_slots: Arc<Semaphore>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        let channel_slots = Arc::new(Semaphore::new(
            state.config.limits.max_channels_per_session,
        ));
        Self {
            state,
            peer_addr,
            user: None,
            fingerprint: None,
            client_version: None,
            channel_slots,
        }
    }

    async fn authenticate(&mut self, credential: Credential<'_>) -> Result<Auth> {
        match self.state.verifier.verify(&credential).await {
            Verdict::Allow => {
                let (user, fingerprint) = match credential {
                    Credential::Anonymous { user } => (user, None),
                    Credential::PublicKey { user, fingerprint } => (user, Some(fingerprint)),
                };
                info!(
                    peer = ?self.peer_addr,
                    user = %user,
                    fingerprint = ?fingerprint,
                    "SSH client authenticated"
                );
                self.user = Some(user.to_string());
                self.fingerprint = fingerprint.map(str::to_string);
                Ok(Auth::Accept)
            }
            Verdict::Deny => {
                warn!(peer = ?self.peer_addr, credential = ?credential, "SSH authentication denied");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }
}

/// Printable form of the client's identification banner.
fn client_version(sshid: &[u8]) -> String {
    String::from_utf8_lossy(sshid).trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Clients that present no key at all.  Only admitted when the verifier
    /// accepts anonymous access.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.authenticate(Credential::Anonymous { user }).await
    }

    /// Authenticate a client by public key fingerprint.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = fingerprint_of(key);
        self.authenticate(Credential::PublicKey {
            user,
            fingerprint: &fingerprint,
        })
        .await
    }

    /// Log who got in and what software they run.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let client_version = client_version(session.remote_sshid());
        info!(
            peer = ?self.peer_addr,
            user = ?self.user,
            client_version = %client_version,
            "SSH session established"
        );
        self.client_version = Some(client_version);
        Ok(())
    }

    /// Accept a `session` channel and start its dispatcher.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(permit) = Arc::clone(&self.channel_slots).try_acquire_owned() else {
            warn!(
                peer = ?self.peer_addr,
                user = ?self.user,
                limit = self.state.config.limits.max_channels_per_session,
                "channel limit reached; refusing session channel"
            );
            return Ok(false);
        };

        info!(
            peer = ?self.peer_addr,
            user = ?self.user,
            fingerprint = ?self.fingerprint,
            client_version = ?self.client_version,
            channel = ?channel.id(),
            "session channel opened"
        );
        let dispatcher =
            ChannelDispatcher::new(Arc::clone(&self.state), session.handle(), channel, permit);
        tokio::spawn(dispatcher.run());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::Engine as _;

    use crate::auth::{AllowAll, AuthorizedKeys};
    use crate::config::Config;
    use crate::git::{AllowedVerbs, ExecPolicy};

    fn state(verifier: Arc<dyn crate::auth::CredentialVerifier>) -> Arc<AppState> {
        let config = Config::default();
        let policy = ExecPolicy::new(AllowedVerbs::pack_protocol(), &config.repo_root, false);
        Arc::new(AppState {
            config: Arc::new(config),
            policy,
            verifier,
        })
    }

    #[tokio::test]
    async fn open_policy_accepts_anonymous() {
        let mut session = SshSession::new(state(Arc::new(AllowAll)), None);
        let auth = session.auth_none("git").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(session.user.as_deref(), Some("git"));
        assert!(session.fingerprint.is_none());
    }

    #[tokio::test]
    async fn allow_list_rejects_anonymous() {
        let verifier = Arc::new(AuthorizedKeys::parse(""));
        let mut session = SshSession::new(state(verifier), None);
        let auth = session.auth_none("git").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(session.user.is_none());
    }

    #[tokio::test]
    async fn allow_list_records_accepted_key() {
        let verifier = Arc::new(AuthorizedKeys::parse(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKJx alice\n",
        ));
        let blob = base64::engine::general_purpose::STANDARD
            .decode("AAAAC3NzaC1lZDI1NTE5AAAAIKJx")
            .unwrap();
        let fingerprint = crate::auth::fingerprint_blob(&blob);
        let mut session = SshSession::new(state(verifier), None);
        let auth = session
            .authenticate(Credential::PublicKey {
                user: "git",
                fingerprint: &fingerprint,
            })
            .await
            .unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(session.fingerprint.as_deref(), Some(fingerprint.as_str()));
    }

    #[test]
    fn client_version_is_printable() {
        assert_eq!(client_version(b"SSH-2.0-OpenSSH_9.6\r\n"), "SSH-2.0-OpenSSH_9.6");
        assert_eq!(client_version(b"SSH-2.0-\xffclient"), "SSH-2.0-\u{fffd}client");
    }

    #[test]
    fn channel_slots_follow_config() {
        let session = SshSession::new(state(Arc::new(AllowAll)), None);
        assert_eq!(session.channel_slots.available_permits(), 8);
    }
}
