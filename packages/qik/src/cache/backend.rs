//! The cache backend abstraction.

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::{
    hash::{ContentHash, Fingerprint},
    repo::RepoPath,
    runnable::Slug,
};

/// The manifest persisted with every cache entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub fingerprint: Fingerprint,
    pub exit_code: i32,
    pub stored_at: jiff::Timestamp,
    /// Artifact files with their content hashes, sorted by path.
    pub artifacts: Vec<ArtifactEntry>,
    /// Truncated captured output, kept inline where artifact bytes are not
    /// stored (the repo backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_head: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: RepoPath,
    pub hash: ContentHash,
}

/// A terminal run, as handed to `put`.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub exit_code: i32,
    /// Combined stdout/stderr, in order.
    pub out: Vec<u8>,
    /// Artifact files present in the working tree after the run.
    pub artifacts: Vec<RepoPath>,
}

/// A cache hit, as returned by `get`.
#[derive(Clone, Debug)]
pub struct CacheHit {
    pub exit_code: i32,
    /// The captured output to replay.
    pub out: Vec<u8>,
    /// Artifacts restored into the working tree.
    pub restored: Vec<RepoPath>,
}

/// Trait for cache backend implementations.
///
/// `get` is idempotent and, apart from artifact restoration, side-effect
/// free; `contains` never mutates anything, so cache-status probing cannot
/// disturb entries. Entries are immutable once a `put` publishes them.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// The configured name of this cache.
    fn name(&self) -> &str;

    /// The backend type tag (`local`, `repo`, ...), as used by the
    /// `--cache-type` selector.
    fn kind(&self) -> &'static str;

    /// Look up an entry, restoring its artifacts on a hit.
    async fn get(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<Option<CacheHit>>;

    /// Report whether an entry exists, without touching it.
    async fn contains(&self, slug: &Slug, fingerprint: &Fingerprint) -> Result<bool>;

    /// Store an entry. Publication is atomic: concurrent readers never see
    /// a partial entry.
    async fn put(&self, slug: &Slug, fingerprint: &Fingerprint, run: &RunResult) -> Result<()>;
}

impl std::fmt::Debug for dyn CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBackend")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}
