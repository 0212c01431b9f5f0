//! The remote cache backend.
//!
//! A remote cache extends the local one: on miss it downloads the entry into
//! the local layout and serves from there; on store it writes through to the
//! local cache first, then uploads. Artifact bytes are content-addressed
//! under `cas/<hash>` so identical artifacts across entries upload once.
//!
//! The transport is the [`ObjectStore`] trait. The built-in [`DirStore`]
//! serves a shared directory (an NFS mount, a synced folder); network
//! transports such as S3 register through the plugin registry.
//!
//! Transport failures degrade: a failed download is a miss, a failed upload
//! keeps the entry local-only. Both warn rather than fail the runnable.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, instrument, warn};

use crate::{
    fs,
    hash::Fingerprint,
    runnable::Slug,
};

use super::backend::{CacheBackend, CacheHit, Manifest, RunResult};
use super::local::{ARTIFACTS_DIR, EXIT_FILE, LocalCache, MANIFEST_FILE, OUT_FILE};

/// How many artifact blobs transfer at once.
const DOWNLOAD_CONCURRENCY: usize = 8;

/// Transport for remote cache storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// A human-readable location, for diagnostics.
    fn describe(&self) -> String;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// An object store backed by a plain directory.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        fs::read_buffered(&self.root.join(key)).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        // Key layouts never collide across writers, so plain write is
        // enough: the final rename in the local layer is what readers see.
        fs::write(&self.root.join(key), bytes).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::exists(&self.root.join(key)).await)
    }
}

/// A local cache that writes through to an object store.
pub struct RemoteCache {
    name: String,
    local: LocalCache,
    store: Arc<dyn ObjectStore>,
}

impl RemoteCache {
    pub fn new(
        name: impl Into<String>,
        local: LocalCache,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            name: name.into(),
            local,
            store,
        }
    }

    fn entry_key(slug: &Slug, fingerprint: &Fingerprint, file: &str) -> String {
        format!("{}/{}/{}", slug.as_str(), fingerprint.as_str(), file)
    }

    /// Download a remote entry into the local layout. Returns false on a
    /// remote miss.
    async fn pull(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<bool> {
        let key = Self::entry_key(slug, fingerprint, MANIFEST_FILE);
        let Some(manifest_bytes) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let manifest: Manifest =
            serde_json::from_slice(&manifest_bytes).context("parse remote manifest")?;

        let dir = self.local.entry_dir(slug, fingerprint);
        let staged = fs::stage_sibling_dir(&dir).await?;
        fs::write(&staged.join(MANIFEST_FILE), &manifest_bytes).await?;

        let out = self
            .store
            .get(&Self::entry_key(slug, fingerprint, OUT_FILE))
            .await?
            .unwrap_or_default();
        fs::write(&staged.join(OUT_FILE), &out).await?;
        fs::write(&staged.join(EXIT_FILE), manifest.exit_code.to_string()).await?;

        // Artifact blobs download concurrently; any missing blob abandons
        // the pull.
        let complete: Vec<bool> = stream::iter(manifest.artifacts.clone())
            .map(|artifact| {
                let store = self.store.clone();
                let staged = staged.clone();
                async move {
                    let key = format!("cas/{}", artifact.hash.as_str());
                    let Some(bytes) = store.get(&key).await? else {
                        warn!(path = %artifact.path, "remote entry is missing artifact bytes");
                        return Ok(false);
                    };
                    fs::write(&staged.join(ARTIFACTS_DIR).join(artifact.path.as_str()), &bytes)
                        .await?;
                    Ok::<_, color_eyre::Report>(true)
                }
            })
            .buffer_unordered(DOWNLOAD_CONCURRENCY)
            .try_collect()
            .await?;
        if complete.iter().any(|found| !found) {
            fs::remove_dir_all(&staged).await?;
            return Ok(false);
        }

        fs::publish_staged(&staged, &dir).await?;
        debug!(%slug, %fingerprint, "pulled remote entry");
        Ok(true)
    }

    /// Upload a local entry. Failures warn; the entry stays local-only.
    async fn push(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<()> {
        let dir = self.local.entry_dir(slug, fingerprint);
        let manifest_bytes = fs::must_read_buffered(&dir.join(MANIFEST_FILE)).await?;
        let manifest: Manifest =
            serde_json::from_slice(&manifest_bytes).context("parse local manifest")?;

        for artifact in &manifest.artifacts {
            let key = format!("cas/{}", artifact.hash.as_str());
            if self.store.exists(&key).await? {
                continue;
            }
            let bytes = fs::must_read_buffered(
                &dir.join(ARTIFACTS_DIR).join(artifact.path.as_str()),
            )
            .await?;
            self.store.put(&key, &bytes).await?;
        }

        let out = fs::read_buffered(&dir.join(OUT_FILE)).await?.unwrap_or_default();
        self.store
            .put(&Self::entry_key(slug, fingerprint, OUT_FILE), &out)
            .await?;
        // The manifest is uploaded last: remote readers treat its presence
        // as the entry being complete.
        self.store
            .put(
                &Self::entry_key(slug, fingerprint, MANIFEST_FILE),
                &manifest_bytes,
            )
            .await?;
        debug!(%slug, %fingerprint, "pushed entry to {}", self.store.describe());
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for RemoteCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "remote"
    }

    #[instrument(name = "RemoteCache::get", skip(self), fields(cache = %self.name))]
    async fn get(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<Option<CacheHit>> {
        if let Some(hit) = self.local.get(slug, fingerprint).await? {
            return Ok(Some(hit));
        }
        match self.pull(slug, fingerprint).await {
            Ok(true) => self.local.get(slug, fingerprint).await,
            Ok(false) => Ok(None),
            Err(err) => {
                warn!(?err, "remote cache unavailable, treating as miss");
                Ok(None)
            }
        }
    }

    #[instrument(name = "RemoteCache::contains", skip(self), fields(cache = %self.name))]
    async fn contains(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<bool> {
        if self.local.contains(slug, fingerprint).await? {
            return Ok(true);
        }
        let key = Self::entry_key(slug, fingerprint, MANIFEST_FILE);
        match self.store.exists(&key).await {
            Ok(exists) => Ok(exists),
            Err(err) => {
                warn!(?err, "remote cache unavailable, treating as cold");
                Ok(false)
            }
        }
    }

    #[instrument(name = "RemoteCache::put", skip(self, run), fields(cache = %self.name))]
    async fn put(&self, slug: &Slug, fingerprint: &Fingerprint, run: &RunResult) -> Result<()> {
        self.local.put(slug, fingerprint, run).await?;
        if let Err(err) = self.push(slug, fingerprint).await {
            warn!(?err, "upload failed, entry stored locally only");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Blake3;
    use crate::repo::RepoPath;
    use pretty_assertions::assert_eq;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::new(Blake3::from_buffer(text))
    }

    fn remote_pair(
        worktree: &std::path::Path,
        store_dir: &std::path::Path,
    ) -> (RemoteCache, Arc<DirStore>) {
        let store = Arc::new(DirStore::new(store_dir));
        let local = LocalCache::new("remote", worktree.join("._qik/cache"))
            .with_worktree(worktree);
        (
            RemoteCache::new("remote", local, store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn write_through_and_pull() {
        let store_dir = tempfile::tempdir().unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();

        let slug = Slug::new("build", None, None);
        let fingerprint = fp("state");

        // First machine stores an entry with an artifact.
        std::fs::write(first.path().join("dist.tar"), b"bytes").unwrap();
        let (cache, _) = remote_pair(first.path(), store_dir.path());
        let run = RunResult {
            exit_code: 0,
            out: b"done\n".to_vec(),
            artifacts: vec![RepoPath::new("dist.tar").unwrap()],
        };
        cache.put(&slug, &fingerprint, &run).await.unwrap();

        // Second machine has no local entry; it pulls from the store and
        // restores the artifact.
        let (other, _) = remote_pair(second.path(), store_dir.path());
        assert!(other.contains(&slug, &fingerprint).await.unwrap());
        let hit = other.get(&slug, &fingerprint).await.unwrap().unwrap();
        assert_eq!(hit.exit_code, 0);
        assert_eq!(hit.out, b"done\n");
        assert_eq!(
            std::fs::read(second.path().join("dist.tar")).unwrap(),
            b"bytes"
        );
    }

    #[tokio::test]
    async fn unreachable_store_degrades_to_miss() {
        let worktree = tempfile::tempdir().unwrap();
        // Point the store at a file, which fails directory operations.
        let bogus = worktree.path().join("not-a-dir");
        std::fs::write(&bogus, b"x").unwrap();

        let store = Arc::new(DirStore::new(bogus.join("nested")));
        let local = LocalCache::new("remote", worktree.path().join("._qik/cache"));
        let cache = RemoteCache::new("remote", local, store);

        let slug = Slug::new("build", None, None);
        assert!(cache.get(&slug, &fp("state")).await.unwrap().is_none());
    }
}
