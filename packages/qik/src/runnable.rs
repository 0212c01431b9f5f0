//! Runnables: concrete invocations produced by template expansion.

use std::collections::BTreeMap;
use std::sync::Arc;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{config::CachePolicy, dep::Dep};

/// The identity of a runnable: `command_name[@space][@module]`.
///
/// The string form is filesystem-safe and is used as the cache key prefix
/// and the per-runnable log file name.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    pub fn new(command: &str, space: Option<&str>, module: Option<&str>) -> Self {
        let mut slug = String::from(command);
        if let Some(space) = space {
            slug.push('@');
            slug.push_str(space);
        }
        if let Some(module) = module {
            slug.push('@');
            slug.push_str(module);
        }
        Self(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A concrete invocation: one command after template expansion across a
/// (space, module) pair.
#[derive(Clone, Debug)]
pub struct Runnable {
    pub slug: Slug,
    /// The defining command's name.
    pub command: String,
    pub space: Option<String>,
    pub module: Option<String>,
    /// The shell string with all placeholders substituted.
    pub exec: String,
    /// The concrete dependency list, base deps first, declaration order
    /// preserved.
    pub deps: Vec<Dep>,
    /// Artifact glob patterns, placeholders substituted.
    pub artifacts: Vec<String>,
    /// The assigned cache, when caching is configured.
    pub cache: Option<String>,
    pub cache_when: CachePolicy,
}

impl Runnable {
    /// The glob patterns this runnable's fingerprint watches, including the
    /// lockfile globs contributed by lock-style dependencies.
    pub fn watched_globs(&self) -> Vec<String> {
        self.deps
            .iter()
            .flat_map(|dep| dep.glob_patterns())
            .collect()
    }
}

/// The full expansion output: every runnable, keyed by slug.
#[derive(Clone, Debug, Default)]
pub struct RunnableSet {
    runnables: BTreeMap<Slug, Arc<Runnable>>,
}

impl RunnableSet {
    pub fn insert(&mut self, runnable: Runnable) {
        self.runnables
            .insert(runnable.slug.clone(), Arc::new(runnable));
    }

    pub fn get(&self, slug: &Slug) -> Option<&Arc<Runnable>> {
        self.runnables.get(slug)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Runnable>> {
        self.runnables.values()
    }

    pub fn slugs(&self) -> impl Iterator<Item = &Slug> {
        self.runnables.keys()
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }

    /// All runnables produced by expanding `command`.
    pub fn of_command<'a>(&'a self, command: &'a str) -> impl Iterator<Item = &'a Arc<Runnable>> {
        self.iter().filter(move |r| r.command == command)
    }
}
