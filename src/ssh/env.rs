//! Per-channel environment collected from SSH `env` requests.
//!
//! Accepted variables only ever reach the subprocess started on the same
//! channel; the server's own environment is left untouched.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvError {
    #[error("empty variable name")]
    EmptyName,
    #[error("variable name {0:?} contains '='")]
    InvalidName(String),
    #[error("variable {0:?} is not accepted")]
    NotAccepted(String),
}

#[derive(Debug, Clone, Default)]
pub struct ChannelEnv {
    vars: BTreeMap<String, String>,
}

impl ChannelEnv {
    /// Record `name=value` if `name` is in `accepted`.  A repeated name
    /// replaces the earlier value.
    ///
    /// NUL bytes are removed from both halves and leading control bytes from
    /// the name before validation.
    pub fn apply(&mut self, name: &str, value: &str, accepted: &[String]) -> Result<(), EnvError> {
        let name: String = name
            .chars()
            .filter(|&c| c != '\0')
            .skip_while(|c| c.is_control())
            .collect();
        let value: String = value.chars().filter(|&c| c != '\0').collect();

        if name.is_empty() {
            return Err(EnvError::EmptyName);
        }
        if name.contains('=') {
            return Err(EnvError::InvalidName(name));
        }
        if !accepted.iter().any(|a| *a == name) {
            return Err(EnvError::NotAccepted(name));
        }

        self.vars.insert(name, value);
        Ok(())
    }

    /// Snapshot of the accepted variables, sorted by name.
    pub fn vars(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
