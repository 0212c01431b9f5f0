//! The local cache backend.
//!
//! Entries live under the private working directory:
//!
//! ```text
//! ._qik/cache/<slug>/<fp>/
//!     manifest.json
//!     out
//!     exit
//!     artifacts/<repo-relative path>
//! ```
//!
//! Entries are staged in a sibling directory and renamed into place, so a
//! partially written entry is never visible. Artifacts are brought in and
//! restored by hardlink where the filesystem allows it, with a copy
//! fallback.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument, trace};

use crate::{
    fs,
    hash::{Blake3, ContentHash, Fingerprint},
    runnable::Slug,
};

use super::backend::{ArtifactEntry, CacheBackend, CacheHit, Manifest, RunResult};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const OUT_FILE: &str = "out";
pub const EXIT_FILE: &str = "exit";
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Local filesystem cache.
#[derive(Clone, Debug)]
pub struct LocalCache {
    name: String,
    /// Root of the entry tree (`._qik/cache`).
    root: PathBuf,
    /// Where artifacts are restored to (the repository root). `None` means
    /// restoration is skipped; the remote backend uses this for its
    /// write-through staging copy.
    worktree: Option<PathBuf>,
}

impl LocalCache {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            worktree: None,
        }
    }

    /// Restore artifacts into `worktree` on `get`.
    pub fn with_worktree(mut self, worktree: impl Into<PathBuf>) -> Self {
        self.worktree = Some(worktree.into());
        self
    }

    pub fn entry_dir(&self, slug: &Slug, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(slug.as_str()).join(fingerprint.as_str())
    }

    /// Slugs that currently have at least one entry.
    pub async fn slugs(&self) -> Result<Vec<String>> {
        let mut slugs = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(slugs),
            Err(err) => return Err(err).context("read cache root"),
        };
        while let Some(entry) = dir.next_entry().await.context("read cache root")? {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                slugs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(slugs)
    }

    /// Drop every entry stored for `slug`.
    pub async fn remove_slug(&self, slug: &str) -> Result<()> {
        fs::remove_dir_all(&self.root.join(slug)).await
    }

    async fn read_entry(&self, dir: &Path) -> Result<Option<(Manifest, Vec<u8>)>> {
        let Some(manifest) = fs::read_buffered(&dir.join(MANIFEST_FILE)).await? else {
            return Ok(None);
        };
        let manifest: Manifest =
            serde_json::from_slice(&manifest).context("parse cache manifest")?;
        let out = fs::read_buffered(&dir.join(OUT_FILE)).await?.unwrap_or_default();
        Ok(Some((manifest, out)))
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    #[instrument(name = "LocalCache::get", skip(self), fields(cache = %self.name))]
    async fn get(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<Option<CacheHit>> {
        let dir = self.entry_dir(slug, fingerprint);
        let Some((manifest, out)) = self.read_entry(&dir).await? else {
            return Ok(None);
        };

        let mut restored = Vec::new();
        if let Some(worktree) = &self.worktree {
            for artifact in &manifest.artifacts {
                let src = dir.join(ARTIFACTS_DIR).join(artifact.path.as_str());
                let dst = artifact.path.to_abs(worktree);
                fs::hardlink_or_copy(&src, &dst)
                    .await
                    .with_context(|| format!("restore artifact {}", artifact.path))?;
                restored.push(artifact.path.clone());
            }
        }

        debug!(%slug, %fingerprint, artifacts = restored.len(), "cache hit");
        Ok(Some(CacheHit {
            exit_code: manifest.exit_code,
            out,
            restored,
        }))
    }

    #[instrument(name = "LocalCache::contains", skip(self), fields(cache = %self.name))]
    async fn contains(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<bool> {
        let manifest = self.entry_dir(slug, fingerprint).join(MANIFEST_FILE);
        Ok(fs::exists(&manifest).await)
    }

    #[instrument(name = "LocalCache::put", skip(self, run), fields(cache = %self.name))]
    async fn put(&self, slug: &Slug, fingerprint: &Fingerprint, run: &RunResult) -> Result<()> {
        let dir = self.entry_dir(slug, fingerprint);
        if fs::exists(&dir.join(MANIFEST_FILE)).await {
            trace!(%slug, %fingerprint, "entry already stored");
            return Ok(());
        }

        let staged = fs::stage_sibling_dir(&dir).await?;

        let mut artifacts = Vec::new();
        if let Some(worktree) = &self.worktree {
            for path in &run.artifacts {
                let src = path.to_abs(worktree);
                let Some(bytes) = fs::read_buffered(&src).await? else {
                    continue;
                };
                let hash = ContentHash::new(Blake3::from_buffer(&bytes).as_str());
                fs::hardlink_or_copy(&src, &staged.join(ARTIFACTS_DIR).join(path.as_str()))
                    .await
                    .with_context(|| format!("store artifact {path}"))?;
                artifacts.push(ArtifactEntry {
                    path: path.clone(),
                    hash,
                });
            }
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));

        let manifest = Manifest {
            fingerprint: fingerprint.clone(),
            exit_code: run.exit_code,
            stored_at: jiff::Timestamp::now(),
            artifacts,
            out_head: None,
        };
        fs::write(
            &staged.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest).context("serialize manifest")?,
        )
        .await?;
        fs::write(&staged.join(OUT_FILE), &run.out).await?;
        fs::write(&staged.join(EXIT_FILE), run.exit_code.to_string()).await?;

        fs::publish_staged(&staged, &dir).await?;
        debug!(%slug, %fingerprint, "stored cache entry");
        Ok(())
    }
}
