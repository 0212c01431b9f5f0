//! Repository discovery and the path types the engine works in.
//!
//! All paths that participate in fingerprints, cache manifests, or selection
//! are repository-root-relative and `/`-separated ([`RepoPath`]), so that two
//! machines with the same tree state produce byte-identical canonical forms.
//! Absolute paths only appear at the filesystem boundary.

use std::path::{Component, Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::Error;

/// The configuration file that marks the repository root.
pub const CONFIG_FILE: &str = "qik.toml";

/// The private (untracked) working directory.
pub const PRIVATE_DIR: &str = "._qik";

/// The repo-tracked working directory.
pub const TRACKED_DIR: &str = ".qik";

/// A repository-root-relative, `/`-separated path.
///
/// Ordering is lexicographic on the string form, which is the canonical
/// ordering the dependency resolver relies on.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoPath(String);

impl RepoPath {
    /// Parse a repo-relative path, normalizing separators to `/`.
    ///
    /// Absolute paths and parent traversals are rejected: everything the
    /// engine fingerprints must live under the repository root.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref().replace('\\', "/");
        let std = Path::new(&raw);
        if std.is_absolute() {
            color_eyre::eyre::bail!("path is not repo-relative: {raw}");
        }
        for component in std.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => color_eyre::eyre::bail!("path escapes the repository: {raw}"),
            }
        }
        let normalized = raw
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against the repository root for filesystem access.
    pub fn to_abs(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// The Python import path form: separators become dots, with a trailing
    /// `.py` or `/__init__.py` stripped.
    pub fn pyimport(&self) -> String {
        let trimmed = self
            .0
            .strip_suffix("/__init__.py")
            .or_else(|| self.0.strip_suffix(".py"))
            .unwrap_or(&self.0);
        trimmed.replace('/', ".")
    }
}

impl AsRef<str> for RepoPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A discovered repository: the root directory plus the state layout under
/// it.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    /// Walk up from `start` until a directory containing `qik.toml` is
    /// found.
    #[instrument]
    pub fn discover(start: &Path) -> Result<Self> {
        let start = start
            .canonicalize()
            .with_context(|| format!("canonicalize {start:?}"))?;
        let mut dir = start.as_path();
        loop {
            if dir.join(CONFIG_FILE).is_file() {
                debug!(root = ?dir, "discovered repository");
                return Ok(Self {
                    root: dir.to_path_buf(),
                });
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => {
                    return Err(Error::ConfigNotFound {
                        start: start.display().to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// Open a repository rooted at a known directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// `._qik/`: caches, logs, and managed virtualenvs. Never committed.
    pub fn private_dir(&self) -> PathBuf {
        self.root.join(PRIVATE_DIR)
    }

    /// `.qik/`: the repo-embedded cache, committed alongside the tree.
    pub fn tracked_dir(&self) -> PathBuf {
        self.root.join(TRACKED_DIR)
    }

    /// Where the local cache keeps entries: `._qik/cache/<slug>/<fp>/`.
    pub fn local_cache_dir(&self) -> PathBuf {
        self.private_dir().join("cache")
    }

    /// Where the repo cache keeps entries: `.qik/cache/<slug>/<fp>/`.
    pub fn repo_cache_dir(&self) -> PathBuf {
        self.tracked_dir().join("cache")
    }

    /// Latest-run logs: `._qik/out/<slug>.log`.
    pub fn out_dir(&self) -> PathBuf {
        self.private_dir().join("out")
    }

    /// Managed virtualenvs: `._qik/venv/<space>/`.
    pub fn venv_dir(&self, space: &str) -> PathBuf {
        self.private_dir().join("venv").join(space)
    }

    /// Make an absolute path repo-relative, if it is under the root.
    pub fn relativize(&self, path: &Path) -> Option<RepoPath> {
        let rel = path.strip_prefix(&self.root).ok()?;
        RepoPath::new(rel.to_string_lossy()).ok()
    }
}
