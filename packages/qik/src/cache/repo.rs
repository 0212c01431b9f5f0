//! The repo-embedded cache backend.
//!
//! Entries live under the tracked working directory and are committed with
//! the tree:
//!
//! ```text
//! .qik/cache/<slug>/<fp>/
//!     manifest.json
//!     exit
//! ```
//!
//! Only the manifest is stored: the exit code, the fingerprint, and a
//! truncated copy of the captured output inline. Artifact bytes are never
//! committed. New entries are added to the git index with intent-to-add
//! semantics so they show up in `git status` without being staged wholesale,
//! and a `.gitattributes` rule routes merges of cache paths through the
//! `qik-cache` driver (which keeps the current side; through git's side swap
//! during rebase that yields ours-on-merge, theirs-on-rebase).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument, warn};

use crate::{
    fs,
    hash::Fingerprint,
    repo::Repo,
    runnable::Slug,
};

use super::backend::{CacheBackend, CacheHit, Manifest, RunResult};
use super::local::{EXIT_FILE, MANIFEST_FILE};

/// How much captured output is kept inline in the manifest.
const OUT_HEAD_LIMIT: usize = 8 * 1024;

const ATTRIBUTES: &str = "cache/** merge=qik-cache\n";

/// Repo-tracked cache.
#[derive(Clone, Debug)]
pub struct RepoCache {
    name: String,
    repo: Repo,
}

impl RepoCache {
    pub fn new(name: impl Into<String>, repo: Repo) -> Self {
        Self {
            name: name.into(),
            repo,
        }
    }

    fn entry_dir(&self, slug: &Slug, fingerprint: &Fingerprint) -> PathBuf {
        self.repo
            .repo_cache_dir()
            .join(slug.as_str())
            .join(fingerprint.as_str())
    }

    /// Install the `.gitattributes` rule for the cache subtree.
    async fn ensure_attributes(&self) -> Result<()> {
        let path = self.repo.tracked_dir().join(".gitattributes");
        match fs::read_buffered_utf8(&path).await? {
            Some(existing) if existing.contains("merge=qik-cache") => Ok(()),
            Some(existing) => fs::write(&path, format!("{existing}{ATTRIBUTES}")).await,
            None => fs::write(&path, ATTRIBUTES).await,
        }
    }

    /// Register freshly written paths with the index without staging their
    /// content. Failures degrade to a warning: the cache entry itself is
    /// already complete.
    async fn intent_to_add(&self, dir: &PathBuf) {
        let result = tokio::process::Command::new("git")
            .args(["add", "--intent-to-add"])
            .arg(dir)
            .arg(self.repo.tracked_dir().join(".gitattributes"))
            .current_dir(self.repo.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "git add --intent-to-add failed"),
            Err(err) => warn!(?err, "could not run git add --intent-to-add"),
        }
    }
}

#[async_trait]
impl CacheBackend for RepoCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "repo"
    }

    #[instrument(name = "RepoCache::get", skip(self), fields(cache = %self.name))]
    async fn get(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<Option<CacheHit>> {
        let dir = self.entry_dir(slug, fingerprint);
        let Some(manifest) = fs::read_buffered(&dir.join(MANIFEST_FILE)).await? else {
            return Ok(None);
        };
        let manifest: Manifest =
            serde_json::from_slice(&manifest).context("parse cache manifest")?;

        debug!(%slug, %fingerprint, "repo cache hit");
        Ok(Some(CacheHit {
            exit_code: manifest.exit_code,
            out: manifest.out_head.unwrap_or_default().into_bytes(),
            restored: vec![],
        }))
    }

    #[instrument(name = "RepoCache::contains", skip(self), fields(cache = %self.name))]
    async fn contains(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(fs::exists(&self.entry_dir(slug, fingerprint).join(MANIFEST_FILE)).await)
    }

    #[instrument(name = "RepoCache::put", skip(self, run), fields(cache = %self.name))]
    async fn put(&self, slug: &Slug, fingerprint: &Fingerprint, run: &RunResult) -> Result<()> {
        let dir = self.entry_dir(slug, fingerprint);
        if fs::exists(&dir.join(MANIFEST_FILE)).await {
            return Ok(());
        }

        let out_head = String::from_utf8_lossy(
            &run.out[..run.out.len().min(OUT_HEAD_LIMIT)],
        )
        .into_owned();

        let manifest = Manifest {
            fingerprint: fingerprint.clone(),
            exit_code: run.exit_code,
            stored_at: jiff::Timestamp::now(),
            artifacts: vec![],
            out_head: Some(out_head),
        };

        let staged = fs::stage_sibling_dir(&dir).await?;
        fs::write(
            &staged.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest).context("serialize manifest")?,
        )
        .await?;
        fs::write(&staged.join(EXIT_FILE), run.exit_code.to_string()).await?;
        fs::publish_staged(&staged, &dir).await?;

        self.ensure_attributes().await?;
        self.intent_to_add(&dir).await;
        debug!(%slug, %fingerprint, "stored repo cache entry");
        Ok(())
    }
}
