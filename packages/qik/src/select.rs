//! The selector: which runnables an invocation operates on.
//!
//! Selectors from the CLI are intersected: names (exact or glob), modules,
//! spaces, cache type, cache status, and `--since`. The surviving runnables
//! are the primary selection; it is then expanded along upstream edges
//! (unless `--isolated`, which keeps only hard edges) and along strict
//! downstream edges, tagging everything pulled in as transitive.

use std::collections::BTreeSet;

use color_eyre::Result;
use tracing::{debug, instrument};

use crate::{
    cache::CacheSet,
    error::Error,
    graph::RunGraph,
    resolve::Resolver,
    runnable::Slug,
    source::{HashSource, compile_globs},
};

/// The `--cache-status` filter values.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, strum::Display, strum::EnumString, clap::ValueEnum,
)]
#[strum(serialize_all = "kebab-case")]
pub enum CacheStatus {
    /// The assigned cache holds an entry for the current fingerprint.
    Warm,
    /// No entry for the current fingerprint.
    Cold,
}

/// The selection inputs, as parsed from the CLI.
#[derive(Clone, Debug, Default)]
pub struct SelectOpts {
    /// Positional command names; exact or glob.
    pub names: Vec<String>,
    pub modules: Vec<String>,
    pub spaces: Vec<String>,
    /// Filter by the assigned cache's backend type.
    pub cache_type: Option<String>,
    /// Filter by probing the assigned cache with current fingerprints.
    pub cache_status: Option<CacheStatus>,
    /// Filter to runnables whose globs intersect files changed since the
    /// ref.
    pub since: Option<String>,
    /// Drop soft transitive upstreams.
    pub isolated: bool,
}

/// A selected subset of the DAG.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    primary: BTreeSet<Slug>,
    transitive: BTreeSet<Slug>,
}

impl Selection {
    pub fn contains(&self, slug: &Slug) -> bool {
        self.primary.contains(slug) || self.transitive.contains(slug)
    }

    pub fn is_primary(&self, slug: &Slug) -> bool {
        self.primary.contains(slug)
    }

    pub fn slugs(&self) -> impl Iterator<Item = &Slug> {
        self.primary.iter().chain(self.transitive.iter())
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.transitive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.transitive.is_empty()
    }
}

/// Apply the selectors and expand the result along the DAG.
#[instrument(skip_all, fields(names = ?opts.names))]
pub async fn select(
    graph: &RunGraph,
    resolver: &Resolver<'_>,
    caches: &CacheSet,
    source: &HashSource,
    opts: &SelectOpts,
) -> Result<Selection> {
    let changed = match &opts.since {
        Some(since) => Some(source.changed_since(since).await?),
        None => None,
    };
    select_with_changed(graph, resolver, caches, opts, changed).await
}

/// [`select`] with the change set already resolved. The watch loop feeds the
/// debounced filesystem events here as the `--since`-equivalent change set.
#[instrument(skip_all)]
pub async fn select_with_changed(
    graph: &RunGraph,
    resolver: &Resolver<'_>,
    caches: &CacheSet,
    opts: &SelectOpts,
    changed: Option<BTreeSet<crate::repo::RepoPath>>,
) -> Result<Selection> {
    let mut candidates: BTreeSet<Slug> = graph.runnables().slugs().cloned().collect();

    if !opts.names.is_empty() {
        candidates = filter_names(graph, &candidates, &opts.names)?;
    }

    if !opts.modules.is_empty() {
        check_known_modules(graph, &opts.modules)?;
        candidates.retain(|slug| {
            graph
                .runnables()
                .get(slug)
                .and_then(|r| r.module.as_deref())
                .is_some_and(|module| opts.modules.iter().any(|m| m == module))
        });
    }

    if !opts.spaces.is_empty() {
        candidates.retain(|slug| {
            graph
                .runnables()
                .get(slug)
                .and_then(|r| r.space.as_deref())
                .is_some_and(|space| opts.spaces.iter().any(|s| s == space))
        });
    }

    if let Some(cache_type) = &opts.cache_type {
        let mut kept = BTreeSet::new();
        for slug in &candidates {
            let runnable = graph.runnable(slug)?;
            let Some(cache) = &runnable.cache else {
                continue;
            };
            if caches.get(cache)?.kind() == cache_type {
                kept.insert(slug.clone());
            }
        }
        candidates = kept;
    }

    if let Some(changed) = &changed {
        let mut kept = BTreeSet::new();
        for slug in &candidates {
            let runnable = graph.runnable(slug)?;
            let globs = runnable.watched_globs();
            if globs.is_empty() {
                continue;
            }
            let set = compile_globs(&globs)?;
            if changed.iter().any(|path| set.is_match(path.as_str())) {
                kept.insert(slug.clone());
            }
        }
        candidates = kept;
    }

    if let Some(status) = opts.cache_status {
        // Probe without executing; `contains` never mutates cache state.
        let mut kept = BTreeSet::new();
        for slug in &candidates {
            let runnable = graph.runnable(slug)?;
            let warm = match &runnable.cache {
                Some(cache) => {
                    let fingerprint = resolver.fingerprint(slug).await?;
                    caches.get(cache)?.contains(slug, &fingerprint).await?
                }
                None => false,
            };
            let keep = match status {
                CacheStatus::Warm => warm,
                CacheStatus::Cold => !warm,
            };
            if keep {
                kept.insert(slug.clone());
            }
        }
        candidates = kept;
    }

    let primary = candidates;

    // Strict downstream edges pull consumers in; then everything selected
    // pulls its upstreams in, soft edges excluded under --isolated.
    let with_downstream = graph.strict_downstream_closure(primary.iter().cloned());
    let expanded = graph.upstream_closure(with_downstream.iter().cloned(), |meta| {
        !opts.isolated || !meta.isolated
    });

    let transitive = expanded
        .into_iter()
        .filter(|slug| !primary.contains(slug))
        .collect::<BTreeSet<_>>();

    debug!(
        primary = primary.len(),
        transitive = transitive.len(),
        "selection"
    );
    Ok(Selection {
        primary,
        transitive,
    })
}

/// Name selectors: exact command names select all their runnables; names
/// with glob metacharacters match command names as patterns. An exact name
/// that matches nothing is a selection error.
fn filter_names(
    graph: &RunGraph,
    candidates: &BTreeSet<Slug>,
    names: &[String],
) -> Result<BTreeSet<Slug>> {
    let mut kept = BTreeSet::new();
    for name in names {
        let is_pattern = name.contains(['*', '?', '[']);
        let matched: Vec<&Slug> = if is_pattern {
            let set = compile_globs(std::slice::from_ref(name))?;
            graph
                .runnables()
                .iter()
                .filter(|r| set.is_match(&r.command))
                .map(|r| &r.slug)
                .collect()
        } else {
            graph
                .runnables()
                .of_command(name)
                .map(|r| &r.slug)
                .collect()
        };

        if matched.is_empty() && !is_pattern {
            return Err(Error::UnknownCommand { name: name.clone() }.into());
        }
        kept.extend(matched.into_iter().cloned());
    }
    Ok(kept.intersection(candidates).cloned().collect())
}

fn check_known_modules(graph: &RunGraph, modules: &[String]) -> Result<()> {
    let known: BTreeSet<&str> = graph
        .runnables()
        .iter()
        .filter_map(|r| r.module.as_deref())
        .collect();
    for module in modules {
        if !known.contains(module.as_str()) {
            return Err(Error::UnknownModule {
                name: module.clone(),
            }
            .into());
        }
    }
    Ok(())
}
