//! The hash source: mapping globs and distributions to stable hashes.
//!
//! File content hashes come from git, not from filesystem timestamps: the
//! tracked file list is `git ls-files` and content hashes are produced by
//! `git hash-object` against the working tree, so the fingerprint reflects
//! exactly the version-controlled state plus local edits. Files outside the
//! index are invisible to fingerprints.
//!
//! The tracked listing is computed once per resolver run and memoized; the
//! resolver depends on its ordering being canonical (repo-relative paths,
//! `/`-separated, sorted lexicographically).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use crate::{
    config::PydistConf,
    hash::ContentHash,
    repo::{PRIVATE_DIR, Repo, RepoPath, TRACKED_DIR},
};

/// The resolved version of a distribution, or the fact that it is missing.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum DistVersion {
    Version(String),
    Missing,
}

/// The hash source for a repository.
pub struct HashSource {
    repo: Repo,
    pydist: PydistConf,
    tracked: OnceCell<Arc<BTreeMap<RepoPath, ContentHash>>>,
}

impl HashSource {
    pub fn new(repo: Repo, pydist: PydistConf) -> Self {
        Self {
            repo,
            pydist,
            tracked: OnceCell::new(),
        }
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    /// The tracked files and their working-tree content hashes, sorted by
    /// path. Computed once per run.
    #[instrument(skip(self))]
    pub async fn tracked(&self) -> Result<Arc<BTreeMap<RepoPath, ContentHash>>> {
        self.tracked
            .get_or_try_init(|| async {
                let listing = self.list_tracked().await?;
                let hashes = self.hash_objects(&listing).await?;
                Ok::<_, color_eyre::Report>(Arc::new(hashes))
            })
            .await
            .cloned()
    }

    /// Map glob patterns to the tracked files matching them, in canonical
    /// order.
    #[instrument(skip(self))]
    pub async fn hash_files(&self, globs: &[String]) -> Result<Vec<(RepoPath, ContentHash)>> {
        if globs.is_empty() {
            return Ok(vec![]);
        }
        let set = compile_globs(globs)?;
        let tracked = self.tracked().await?;
        Ok(tracked
            .iter()
            .filter(|(path, _)| set.is_match(path.as_str()))
            .map(|(path, hash)| (path.clone(), hash.clone()))
            .collect())
    }

    /// Files changed in the working tree since the given git ref.
    #[instrument(skip(self))]
    pub async fn changed_since(&self, git_ref: &str) -> Result<BTreeSet<RepoPath>> {
        let out = self
            .git(&["diff", "--name-only", "-z", git_ref])
            .await
            .with_context(|| format!("diff against {git_ref}"))?;
        out.split('\0')
            .filter(|line| !line.is_empty())
            .map(RepoPath::new)
            .collect::<Result<BTreeSet<_>>>()
            .tap(|paths| {
                if let Ok(paths) = paths {
                    debug!(count = paths.len(), %git_ref, "changed files");
                }
            })
    }

    /// Resolve the installed version of a distribution.
    ///
    /// Consults, in order: the configured override map, the site-packages
    /// metadata under `venv_dir`, and the configured lockfile.
    #[instrument(skip(self, venv_dir))]
    pub async fn hash_dist(&self, name: &str, venv_dir: Option<&Path>) -> Result<DistVersion> {
        let canonical = canonical_dist_name(name);

        if let Some(version) = self
            .pydist
            .versions
            .iter()
            .find(|(key, _)| canonical_dist_name(key) == canonical)
            .map(|(_, version)| version)
        {
            trace!(%name, %version, "dist version from overrides");
            return Ok(DistVersion::Version(version.clone()));
        }

        if let Some(venv_dir) = venv_dir {
            if let Some(version) = site_packages_version(venv_dir, &canonical).await? {
                trace!(%name, %version, "dist version from site-packages");
                return Ok(DistVersion::Version(version));
            }
        }

        if let Some(lock_file) = &self.pydist.lock_file {
            let path = RepoPath::new(lock_file)?.to_abs(self.repo.root());
            if let Some(content) = crate::fs::read_buffered_utf8(&path).await? {
                if let Some(version) = lockfile_version(&content, &canonical) {
                    trace!(%name, %version, "dist version from lockfile");
                    return Ok(DistVersion::Version(version));
                }
            }
        }

        Ok(DistVersion::Missing)
    }

    async fn list_tracked(&self) -> Result<Vec<RepoPath>> {
        let out = self
            .git(&["ls-files", "-z"])
            .await
            .context("list tracked files")?;
        out.split('\0')
            .filter(|line| !line.is_empty())
            .map(RepoPath::new)
            .collect()
    }

    /// Hash the working-tree contents of the given paths in one `git
    /// hash-object` invocation. Tracked files deleted from the working tree
    /// are omitted.
    async fn hash_objects(
        &self,
        paths: &[RepoPath],
    ) -> Result<BTreeMap<RepoPath, ContentHash>> {
        let mut present = Vec::with_capacity(paths.len());
        for path in paths {
            if crate::fs::exists(&path.to_abs(self.repo.root())).await {
                present.push(path.clone());
            }
        }
        if present.is_empty() {
            return Ok(BTreeMap::new());
        }

        let stdin = present
            .iter()
            .map(RepoPath::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let out = self
            .git_with_stdin(&["hash-object", "--stdin-paths"], stdin.as_bytes())
            .await
            .context("hash working tree files")?;

        let hashes: Vec<&str> = out.lines().collect();
        if hashes.len() != present.len() {
            bail!(
                "git hash-object returned {} hashes for {} paths",
                hashes.len(),
                present.len()
            );
        }
        Ok(present
            .into_iter()
            .zip(hashes)
            .map(|(path, hash)| (path, ContentHash::new(hash)))
            .collect())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(self.repo.root())
            .stdin(Stdio::null())
            .output()
            .await
            .context("spawn git")?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("git output is not utf8")
    }

    async fn git_with_stdin(&self, args: &[&str], stdin: &[u8]) -> Result<String> {
        let mut child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(self.repo.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn git")?;

        let mut handle = child.stdin.take().expect("stdin is piped");
        handle.write_all(stdin).await.context("write git stdin")?;
        drop(handle);

        let output = child.wait_with_output().await.context("wait for git")?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("git output is not utf8")
    }
}

use tap::Tap;

/// Files in the working tree matching the given globs, tracked or not.
///
/// Used to collect artifacts after a run; command outputs are usually
/// untracked, so this walks the filesystem instead of the index. The state
/// directories and `.git` are skipped.
#[instrument(skip(repo))]
pub async fn working_files(repo: &Repo, globs: &[String]) -> Result<Vec<RepoPath>> {
    if globs.is_empty() {
        return Ok(vec![]);
    }
    let set = compile_globs(globs)?;
    let repo = repo.clone();

    tokio::task::spawn_blocking(move || {
        let mut matched = Vec::new();
        let walker = WalkDir::new(repo.root()).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            name != ".git" && name != PRIVATE_DIR && name != TRACKED_DIR
        });
        for entry in walker {
            let entry = entry.context("walk working tree")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = repo.relativize(entry.path()) else {
                continue;
            };
            if set.is_match(path.as_str()) {
                matched.push(path);
            }
        }
        matched.sort();
        Ok(matched)
    })
    .await
    .context("join task")?
}

/// Compile glob patterns into one matcher. Separators are not treated as
/// literal, so `**.py` matches at any depth the way the configuration
/// language promises.
pub fn compile_globs(globs: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in globs {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {pattern}"))?);
    }
    builder.build().context("compile glob set")
}

/// PEP 503 normalization: case-insensitive, runs of `-_.` are equivalent.
fn canonical_dist_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for ch in name.chars() {
        if ch == '-' || ch == '_' || ch == '.' {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// Find `{name}-{version}.dist-info` under the venv's site-packages.
async fn site_packages_version(venv_dir: &Path, canonical: &str) -> Result<Option<String>> {
    let venv_dir = venv_dir.to_path_buf();
    let canonical = canonical.to_string();

    tokio::task::spawn_blocking(move || {
        for entry in WalkDir::new(&venv_dir).max_depth(4) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some(stem) = name.strip_suffix(".dist-info") else {
                continue;
            };
            let Some((dist, version)) = stem.rsplit_once('-') else {
                continue;
            };
            if canonical_dist_name(dist) == canonical {
                return Ok(Some(version.to_string()));
            }
        }
        Ok(None)
    })
    .await
    .context("join task")?
}

/// Parse `name==version` lines from a requirements-style lockfile.
fn lockfile_version(content: &str, canonical: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, version)) = line.split_once("==") else {
            continue;
        };
        if canonical_dist_name(name.trim()) == canonical {
            let version = version
                .trim()
                .split(|c: char| c.is_whitespace() || c == ';')
                .next()
                .unwrap_or_default();
            return Some(version.to_string());
        }
    }
    None
}
