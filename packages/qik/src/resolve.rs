//! The dependency resolver: runnables to fingerprints.
//!
//! A fingerprint digests the canonical serialization of the runnable's
//! resolved shell string, each dependency's contribution in declaration
//! order, the artifact glob list, and the serialization format version tag.
//! Every contribution is length-framed (see `Blake3::from_frames`) so no
//! contribution can collide with a neighbor's concatenation.
//!
//! The resolver is deterministic across machines for the same tree state and
//! configuration: nothing here reads the environment except through `const`
//! values already captured at expansion.

use std::collections::BTreeMap;

use color_eyre::Result;
use dashmap::DashMap;
use tracing::{instrument, trace};

use crate::{
    config::Config,
    dep::Dep,
    error::Error,
    graph::RunGraph,
    hash::{Blake3, Fingerprint},
    runnable::{Runnable, Slug},
    source::{DistVersion, HashSource},
    venv,
};

/// The serialization format version. Changing anything about how
/// contributions are framed must change this tag so stale cache entries
/// never match.
pub const FINGERPRINT_VERSION: &str = "qik/v1";

/// The sentinel contributed for suppressed missing distributions.
const MISSING_SENTINEL: &str = "<missing>";

/// Fingerprint resolver over a built graph.
pub struct Resolver<'a> {
    config: &'a Config,
    graph: &'a RunGraph,
    source: &'a HashSource,
    memo: DashMap<Slug, Fingerprint>,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a Config, graph: &'a RunGraph, source: &'a HashSource) -> Self {
        Self {
            config,
            graph,
            source,
            memo: DashMap::new(),
        }
    }

    /// The fingerprint of one runnable. Upstream fingerprints are computed
    /// first (the graph is acyclic) and memoized for the life of the
    /// resolver.
    #[instrument(skip(self))]
    pub async fn fingerprint(&self, slug: &Slug) -> Result<Fingerprint> {
        if let Some(found) = self.memo.get(slug) {
            return Ok(found.value().clone());
        }

        let needed = self
            .graph
            .upstream_closure([slug.clone()], |_| true);
        for next in self.graph.topo() {
            if !needed.contains(&next) || self.memo.contains_key(&next) {
                continue;
            }
            let runnable = self.graph.runnable(&next)?;
            let fingerprint = self.compute(runnable).await?;
            trace!(slug = %next, %fingerprint, "fingerprint");
            self.memo.insert(next, fingerprint);
        }

        Ok(self
            .memo
            .get(slug)
            .expect("topo order covers the closure")
            .value()
            .clone())
    }

    /// Fingerprints for many runnables at once.
    pub async fn fingerprint_all(
        &self,
        slugs: impl IntoIterator<Item = Slug>,
    ) -> Result<BTreeMap<Slug, Fingerprint>> {
        let mut out = BTreeMap::new();
        for slug in slugs {
            let fingerprint = self.fingerprint(&slug).await?;
            out.insert(slug, fingerprint);
        }
        Ok(out)
    }

    async fn compute(&self, runnable: &Runnable) -> Result<Fingerprint> {
        let mut frames: Vec<Vec<u8>> = Vec::with_capacity(runnable.deps.len() + 3);
        frames.push(FINGERPRINT_VERSION.as_bytes().to_vec());
        frames.push(format!("exec:{}", runnable.exec).into_bytes());

        for dep in &runnable.deps {
            frames.push(self.contribution(runnable, dep).await?);
        }

        let mut artifacts = runnable.artifacts.clone();
        artifacts.sort();
        frames.push(format!("artifacts:{}", artifacts.join("\n")).into_bytes());

        Ok(Fingerprint::new(Blake3::from_frames(frames)))
    }

    /// One dependency's canonical byte contribution.
    async fn contribution(&self, runnable: &Runnable, dep: &Dep) -> Result<Vec<u8>> {
        match dep {
            Dep::Glob(glob) => {
                let patterns = [glob.pattern.clone()];
                self.glob_contribution("glob", &glob.pattern, &patterns).await
            }
            Dep::Const(dep) => Ok(format!("const:{}", dep.value).into_bytes()),
            Dep::Dist(dep) => {
                let venv_dir = runnable
                    .space
                    .as_deref()
                    .and_then(|name| self.config.space(name))
                    .and_then(|space| venv::venv_dir(&self.config.repo, space));
                let version = self
                    .source
                    .hash_dist(&dep.name, venv_dir.as_deref())
                    .await?;
                let version = match version {
                    DistVersion::Version(version) => version,
                    DistVersion::Missing if self.config.pydist.ignore_missing => {
                        String::from(MISSING_SENTINEL)
                    }
                    DistVersion::Missing => {
                        return Err(match &runnable.module {
                            Some(module) => Error::MissingModuleDist {
                                module: module.clone(),
                                name: dep.name.clone(),
                            },
                            None => Error::MissingDist {
                                name: dep.name.clone(),
                            },
                        }
                        .into());
                    }
                };
                Ok(format!("dist:{}={version}", dep.name).into_bytes())
            }
            Dep::Command(dep) => {
                // Targets are already in slug order; their fingerprints are
                // memoized before this runnable's in topological order.
                let mut out = String::from("cmd:");
                for target in &dep.targets {
                    let fingerprint = self
                        .memo
                        .get(target)
                        .map(|found| found.value().clone())
                        .expect("upstream fingerprint resolved first");
                    out.push_str(&format!("{target}={fingerprint}\n"));
                }
                Ok(out.into_bytes())
            }
            Dep::Lock(dep) => {
                self.glob_contribution("lock", &dep.command, &dep.artifacts)
                    .await
            }
        }
    }

    async fn glob_contribution(
        &self,
        tag: &str,
        label: &str,
        patterns: &[String],
    ) -> Result<Vec<u8>> {
        let files = self.source.hash_files(patterns).await?;
        let mut out = format!("{tag}:{label}\n");
        for (path, hash) in files {
            out.push_str(&format!("{path}={hash}\n"));
        }
        Ok(out.into_bytes())
    }
}
