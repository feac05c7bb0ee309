//! Git side of the gateway: turning an exec payload into a safe invocation
//! of a pack-protocol program, and relaying that program's streams.
//!
//! Nothing in this module knows about SSH; the channel dispatcher feeds it
//! raw command text and consumes the resulting [`relay::RunningCommand`].

pub mod command;
pub mod relay;
pub mod repo_path;
pub mod verbs;

use std::path::Path;

use tracing::debug;

pub use command::{CommandError, GitCommand};
pub use relay::Invocation;
pub use repo_path::{PathError, RepoResolver};
pub use verbs::{AccessMode, AllowedVerbs};

/// Why an exec request was refused before any process was started.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("invalid repository path: {0}")]
    Path(#[from] PathError),
    #[error("write access is disabled on this server")]
    WriteDisabled,
}

/// Everything needed to validate an exec request.  Built once at startup.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    verbs: AllowedVerbs,
    resolver: RepoResolver,
    read_only: bool,
}

impl ExecPolicy {
    pub fn new(verbs: AllowedVerbs, repo_root: &Path, read_only: bool) -> Self {
        Self {
            verbs,
            resolver: RepoResolver::new(repo_root),
            read_only,
        }
    }

    pub fn repo_root(&self) -> &Path {
        self.resolver.root()
    }

    /// Validate `payload` and produce the process to run for it.
    ///
    /// Fails without side effects when the payload has no `git` token, the
    /// verb is not allowed, a write is attempted on a read-only server, or
    /// the repository path would leave the root.
    pub fn plan(
        &self,
        payload: &str,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Invocation, RequestError> {
        let text = command::locate_git(payload).ok_or(CommandError::NotGit)?;
        let cmd = GitCommand::parse(text, &self.verbs)?;
        if self.read_only && cmd.mode == AccessMode::Write {
            return Err(RequestError::WriteDisabled);
        }

        let repo = self.resolver.resolve(&cmd.argument)?;
        debug!(verb = %cmd.verb, repo = %repo.display(), mode = ?cmd.mode, "exec request validated");
        Ok(Invocation::new(&cmd.verb, &repo, self.repo_root()).with_env(env))
    }
}
