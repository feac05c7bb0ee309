use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable that overrides the configured SSH port.
pub const SSH_PORT_ENV: &str = "SSH_PORT";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the SSH listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// TCP port for the SSH listener.  `SSH_PORT` takes precedence.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory under which every served repository is resolved.
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,
    /// Host identity key.  Generated on first start if missing.
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            repo_root: default_repo_root(),
            host_key_path: default_host_key_path(),
            auth: AuthConfig::default(),
            access: AccessConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// `host:port` string the acceptor binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_repo_root() -> PathBuf {
    PathBuf::from("myrepo")
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("ssh/host_ed25519")
}

// ---------------------------------------------------------------------------
// Client authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Every connecting identity is accepted, with or without a key.
    #[default]
    Open,
    /// Only public keys listed in `authorized_keys_path` are accepted.
    AuthorizedKeys,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// OpenSSH `authorized_keys` file consulted in `authorized-keys` mode.
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            authorized_keys_path: default_authorized_keys_path(),
        }
    }
}

fn default_authorized_keys_path() -> PathBuf {
    PathBuf::from("ssh/authorized_keys")
}

// ---------------------------------------------------------------------------
// Repository access
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Refuse verbs tagged as writes (`git-receive-pack`).
    #[serde(default)]
    pub read_only: bool,
    /// Environment variable names a client may set through `env` requests.
    /// Git clients send `GIT_PROTOCOL=version=2` to negotiate protocol v2.
    #[serde(default = "default_accepted_env")]
    pub accepted_env: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            accepted_env: default_accepted_env(),
        }
    }
}

fn default_accepted_env() -> Vec<String> {
    vec!["GIT_PROTOCOL".to_string()]
}

// ---------------------------------------------------------------------------
// Concurrency limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Connections served at once; further connections are dropped.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Session channels open at once within one connection.
    #[serde(default = "default_max_channels_per_session")]
    pub max_channels_per_session: usize,
    /// Disconnect sessions idle for this many seconds.  Unset means never.
    #[serde(default)]
    pub inactivity_timeout_secs: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels_per_session: default_max_channels_per_session(),
            inactivity_timeout_secs: None,
        }
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_max_channels_per_session() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load the configuration from an optional YAML file, apply environment
/// overrides, and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            parse_config(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config, std::env::var(SSH_PORT_ENV).ok().as_deref())?;
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserialises to `null`, not to an empty mapping.
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

fn apply_env_overrides(config: &mut Config, ssh_port: Option<&str>) -> Result<()> {
    if let Some(port) = ssh_port.map(str::trim).filter(|p| !p.is_empty()) {
        config.port = port
            .parse()
            .with_context(|| format!("invalid {SSH_PORT_ENV} value: {port:?}"))?;
    }
    Ok(())
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.repo_root.as_os_str().is_empty(),
        "repo_root must not be empty"
    );
    anyhow::ensure!(
        config.limits.max_connections >= 1,
        "limits.max_connections must be at least 1"
    );
    anyhow::ensure!(
        config.limits.max_channels_per_session >= 1,
        "limits.max_channels_per_session must be at least 1"
    );
    for name in &config.access.accepted_env {
        anyhow::ensure!(
            !name.is_empty() && !name.contains('=') && !name.contains('\0'),
            "invalid name in access.accepted_env: {name:?}"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_deployment() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:22");
        assert_eq!(config.repo_root, PathBuf::from("myrepo"));
        assert_eq!(config.auth.mode, AuthMode::Open);
        assert!(!config.access.read_only);
        assert_eq!(config.access.accepted_env, vec!["GIT_PROTOCOL"]);
        assert!(config.limits.inactivity_timeout_secs.is_none());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse_config("  \n").unwrap();
        assert_eq!(config.port, 22);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
port: 2222
repo_root: /srv/git
auth:
  mode: authorized-keys
limits:
  max_channels_per_session: 2
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.repo_root, PathBuf::from("/srv/git"));
        assert_eq!(config.auth.mode, AuthMode::AuthorizedKeys);
        assert_eq!(
            config.auth.authorized_keys_path,
            PathBuf::from("ssh/authorized_keys")
        );
        assert_eq!(config.limits.max_channels_per_session, 2);
        assert_eq!(config.limits.max_connections, 256);
    }

    #[test]
    fn ssh_port_env_overrides_file() {
        let mut config = parse_config("port: 2222").unwrap();
        apply_env_overrides(&mut config, Some("2022")).unwrap();
        assert_eq!(config.port, 2022);
    }

    #[test]
    fn blank_ssh_port_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, Some("")).unwrap();
        assert_eq!(config.port, 22);
    }

    #[test]
    fn non_numeric_ssh_port_is_rejected() {
        let mut config = Config::default();
        assert!(apply_env_overrides(&mut config, Some("twenty-two")).is_err());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = Config::default();
        config.limits.max_connections = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn env_names_with_equals_are_rejected() {
        let mut config = Config::default();
        config.access.accepted_env.push("A=B".to_string());
        assert!(validate_config(&config).is_err());
    }
}
