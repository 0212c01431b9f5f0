//! Cache backends.
//!
//! This module defines the `CacheBackend` trait that abstracts over cache
//! storage implementations, plus the three built-ins:
//!
//! - `LocalCache`: entries under the private working directory.
//! - `RepoCache`: manifest-only entries under the tracked working directory,
//!   committed alongside the tree.
//! - `RemoteCache`: a local cache that writes through to an object store.

mod backend;
mod local;
mod remote;
mod repo;

pub use backend::{ArtifactEntry, CacheBackend, CacheHit, Manifest, RunResult};
pub use local::LocalCache;
pub use remote::{DirStore, ObjectStore, RemoteCache};
pub use repo::RepoCache;

use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::Result;

use crate::{config::Config, error::Error, plugin::Registry};

/// Every configured cache backend, keyed by name.
///
/// The built-in `local` and `repo` caches are always available; `[caches]`
/// sections add more through the registry's factories.
#[derive(Clone)]
pub struct CacheSet {
    backends: BTreeMap<String, Arc<dyn CacheBackend>>,
}

impl std::fmt::Debug for CacheSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSet")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CacheSet {
    pub fn build(config: &Config, registry: &Registry) -> Result<Self> {
        let mut backends: BTreeMap<String, Arc<dyn CacheBackend>> = BTreeMap::new();
        backends.insert(
            String::from("local"),
            Arc::new(
                LocalCache::new("local", config.repo.local_cache_dir())
                    .with_worktree(config.repo.root()),
            ),
        );
        backends.insert(
            String::from("repo"),
            Arc::new(RepoCache::new("repo", config.repo.clone())),
        );

        for (name, conf) in &config.caches {
            let backend = registry.cache_backend(name, conf, &config.repo)?;
            backends.insert(name.clone(), backend);
        }

        Ok(Self { backends })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn CacheBackend>> {
        self.backends.get(name).ok_or_else(|| {
            Error::UnknownCache {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}
