//! The fixed set of pack-protocol programs a client may invoke.

use std::collections::HashMap;

/// Whether a verb reads from or writes to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Immutable mapping from verb name to its [`AccessMode`].
///
/// Built once at startup and shared by reference; nothing mutates it after
/// construction.
#[derive(Debug, Clone)]
pub struct AllowedVerbs {
    verbs: HashMap<&'static str, AccessMode>,
}

impl AllowedVerbs {
    /// The three transports git uses for clone, fetch, archive and push.
    pub fn pack_protocol() -> Self {
        let verbs = HashMap::from([
            ("git-upload-pack", AccessMode::Read),
            ("git-upload-archive", AccessMode::Read),
            ("git-receive-pack", AccessMode::Write),
        ]);
        Self { verbs }
    }

    /// Look up a verb.  The compound spelling `git upload-pack` resolves to
    /// the same entry as `git-upload-pack`.
    pub fn lookup(&self, verb: &str) -> Option<AccessMode> {
        match verb.split_once(' ') {
            Some((program, sub)) => self.verbs.get(format!("{program}-{sub}").as_str()),
            None => self.verbs.get(verb),
        }
        .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_protocol_modes() {
        let verbs = AllowedVerbs::pack_protocol();
        assert_eq!(verbs.lookup("git-upload-pack"), Some(AccessMode::Read));
        assert_eq!(verbs.lookup("git-upload-archive"), Some(AccessMode::Read));
        assert_eq!(verbs.lookup("git-receive-pack"), Some(AccessMode::Write));
    }

    #[test]
    fn compound_spelling_resolves() {
        let verbs = AllowedVerbs::pack_protocol();
        assert_eq!(verbs.lookup("git receive-pack"), Some(AccessMode::Write));
    }

    #[test]
    fn unknown_verbs_are_absent() {
        let verbs = AllowedVerbs::pack_protocol();
        assert_eq!(verbs.lookup("git-shell"), None);
        assert_eq!(verbs.lookup("git"), None);
        assert_eq!(verbs.lookup(""), None);
        assert_eq!(verbs.lookup("GIT-UPLOAD-PACK"), None);
    }
}
