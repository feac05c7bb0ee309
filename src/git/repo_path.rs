//! Mapping of a client-supplied repository argument onto the served tree.

use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("repository path is empty")]
    Empty,
    #[error("repository path contains a NUL byte")]
    InvalidCharacter,
    #[error("repository path escapes the repository root")]
    Traversal,
    #[error("failed to inspect repository path: {0}")]
    Io(#[from] io::Error),
}

/// Resolves repository arguments to paths strictly inside one root.
#[derive(Debug, Clone)]
pub struct RepoResolver {
    root: PathBuf,
}

impl RepoResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `argument` (e.g. `'/Team/App.git'`) to `<root>/team/app.git`.
    ///
    /// Surrounding single quotes and leading slashes are dropped and the
    /// result is lower-cased.  `..` components are refused outright, and when
    /// the target already exists its canonical form must still live under
    /// the canonical root, which catches symlinks pointing elsewhere.
    pub fn resolve(&self, argument: &str) -> Result<PathBuf, PathError> {
        let relative = argument
            .trim_matches('\'')
            .to_lowercase()
            .trim_start_matches('/')
            .to_string();
        if relative.contains('\0') {
            return Err(PathError::InvalidCharacter);
        }

        let mut clean = PathBuf::new();
        for component in Path::new(&relative).components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Traversal);
                }
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(PathError::Empty);
        }

        let target = self.root.join(&clean);
        self.ensure_contained(&target)?;
        Ok(target)
    }

    fn ensure_contained(&self, target: &Path) -> Result<(), PathError> {
        let target_canon = match target.canonicalize() {
            Ok(path) => path,
            // Nothing on disk yet; the lexical check already holds.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let root_canon = self.root.canonicalize()?;
        if target_canon == root_canon || !target_canon.starts_with(&root_canon) {
            return Err(PathError::Traversal);
        }
        Ok(())
    }
}
