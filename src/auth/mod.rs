//! Client authentication policy.
//!
//! The SSH session asks a [`CredentialVerifier`] once per authentication
//! attempt.  [`AllowAll`] admits everyone (anonymous clients included);
//! [`AuthorizedKeys`] admits only listed public keys.

pub mod authorized_keys;

use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};

use crate::config::{AuthConfig, AuthMode};

pub use authorized_keys::AuthorizedKeys;

/// What a client presented during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    /// The `none` method: a user name and nothing else.
    Anonymous { user: &'a str },
    /// A public key, identified by its `SHA256:` fingerprint.
    PublicKey { user: &'a str, fingerprint: &'a str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

#[async_trait::async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Whether the `none` authentication method should be offered at all.
    fn accepts_anonymous(&self) -> bool;

    async fn verify(&self, credential: &Credential<'_>) -> Verdict;
}

/// Admits every client.  Matches a server configured without client auth.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl CredentialVerifier for AllowAll {
    fn accepts_anonymous(&self) -> bool {
        true
    }

    async fn verify(&self, _credential: &Credential<'_>) -> Verdict {
        Verdict::Allow
    }
}

/// Build the verifier selected by `config`.
pub fn build_verifier(config: &AuthConfig) -> Result<Arc<dyn CredentialVerifier>> {
    Ok(match config.mode {
        AuthMode::Open => Arc::new(AllowAll),
        AuthMode::AuthorizedKeys => Arc::new(AuthorizedKeys::load(&config.authorized_keys_path)?),
    })
}

/// SHA-256 fingerprint of a raw SSH key blob, formatted like
/// `ssh-keygen -l` (`SHA256:` followed by unpadded base64).
pub fn fingerprint_blob(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

/// Fingerprint of a key presented by a client.
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64().as_bytes())
        .unwrap_or_default();
    fingerprint_blob(&blob)
}
