//! Public-key allow-list backed by an OpenSSH `authorized_keys` file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use tracing::{debug, info, warn};

use super::{fingerprint_blob, Credential, CredentialVerifier, Verdict};

/// Key type prefixes that introduce the key blob on an `authorized_keys` line.
const KEY_TYPE_PREFIXES: &[&str] = &["ssh-", "ecdsa-sha2-", "sk-"];

#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    /// Fingerprint -> trailing comment (usually `user@host`).
    keys: HashMap<String, String>,
}

impl AuthorizedKeys {
    /// Read and parse an `authorized_keys` file.  The file must list at least
    /// one usable key.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read authorized keys: {}", path.display()))?;
        let keys = Self::parse(&contents);
        anyhow::ensure!(
            !keys.is_empty(),
            "no usable keys in authorized keys file: {}",
            path.display()
        );
        info!(path = %path.display(), count = keys.len(), "loaded authorized keys");
        Ok(keys)
    }

    /// Parse `authorized_keys` text.  Unparseable lines are logged and skipped.
    pub fn parse(contents: &str) -> Self {
        let mut keys = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((fingerprint, comment)) => {
                    keys.insert(fingerprint, comment);
                }
                None => warn!(line = index + 1, "skipping malformed authorized_keys line"),
            }
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Returns `(fingerprint, comment)` for one non-comment line.
///
/// Option fields such as `no-pty,command="..."` may precede the key type.
fn parse_line(line: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let type_index = fields
        .iter()
        .position(|field| KEY_TYPE_PREFIXES.iter().any(|p| field.starts_with(p)))?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(fields.get(type_index + 1)?)
        .ok()?;
    let comment = fields[type_index + 2..].join(" ");
    Some((fingerprint_blob(&blob), comment))
}

#[async_trait::async_trait]
impl CredentialVerifier for AuthorizedKeys {
    fn accepts_anonymous(&self) -> bool {
        false
    }

    async fn verify(&self, credential: &Credential<'_>) -> Verdict {
        match credential {
            Credential::PublicKey { user, fingerprint } => match self.keys.get(*fingerprint) {
                Some(comment) => {
                    debug!(user, fingerprint, key = %comment, "public key is authorized");
                    Verdict::Allow
                }
                None => Verdict::Deny,
            },
            Credential::Anonymous { .. } => Verdict::Deny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Blob contents are irrelevant to fingerprinting; any valid base64 works.
    const BLOB_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIKJx";
    const BLOB_B: &str = "AAAAB3NzaC1yc2EAAAADAQAB";

    fn fp(blob: &str) -> String {
        fingerprint_blob(
            &base64::engine::general_purpose::STANDARD
                .decode(blob)
                .unwrap(),
        )
    }

    #[test]
    fn parses_plain_and_optioned_lines() {
        let text = format!(
            "# deploy keys\n\
             \n\
             ssh-ed25519 {BLOB_A} alice@laptop\n\
             no-pty,no-port-forwarding ssh-rsa {BLOB_B}\n\
             garbage line\n"
        );
        let keys = AuthorizedKeys::parse(&text);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.keys.get(&fp(BLOB_A)).unwrap(), "alice@laptop");
        assert_eq!(keys.keys.get(&fp(BLOB_B)).unwrap(), "");
    }

    #[test]
    fn invalid_base64_is_skipped() {
        let keys = AuthorizedKeys::parse("ssh-ed25519 !!!not-base64!!! bob\n");
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn only_listed_keys_are_allowed() {
        let keys = AuthorizedKeys::parse(&format!("ssh-ed25519 {BLOB_A} alice\n"));
        let listed = fp(BLOB_A);
        let other = fp(BLOB_B);

        assert!(!keys.accepts_anonymous());
        assert_eq!(
            keys.verify(&Credential::PublicKey {
                user: "git",
                fingerprint: &listed
            })
            .await,
            Verdict::Allow
        );
        assert_eq!(
            keys.verify(&Credential::PublicKey {
                user: "git",
                fingerprint: &other
            })
            .await,
            Verdict::Deny
        );
        assert_eq!(
            keys.verify(&Credential::Anonymous { user: "git" }).await,
            Verdict::Deny
        );
    }

    #[test]
    fn load_rejects_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("authorized_keys");
        std::fs::write(&path, "# nothing here\n").unwrap();
        assert!(AuthorizedKeys::load(&path).is_err());
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("authorized_keys");
        std::fs::write(&path, format!("ssh-ed25519 {BLOB_A} alice\n")).unwrap();
        assert_eq!(AuthorizedKeys::load(&path).unwrap().len(), 1);
    }
}
