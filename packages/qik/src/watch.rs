//! The watch loop: re-derive the selection reactively.
//!
//! A notify watcher observes the repository root recursively; a debouncer
//! coalesces event bursts (~200 ms). After each debounce tick the selector
//! re-runs with the accumulated change set standing in for `--since`, and
//! the scheduler executes the result. Work in flight finishes before the
//! next tick is processed: events that arrive meanwhile pile up in the
//! channel and coalesce into one re-run.
//!
//! Events under `.git` and the state directories are ignored, so cache
//! writes and log files never re-trigger the loop. Because the whole root is
//! watched recursively, files newly created under a glob (including in new
//! subdirectories) are picked up without re-registration.

use std::collections::BTreeSet;
use std::time::Duration;

use color_eyre::{Result, eyre::Context};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebounceEventResult, new_debouncer};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::{
    cache::CacheSet,
    config::Config,
    graph::RunGraph,
    out::Sink,
    repo::{PRIVATE_DIR, RepoPath, TRACKED_DIR},
    resolve::Resolver,
    sched::{ExecOpts, Scheduler},
    select::{SelectOpts, select_with_changed},
    source::HashSource,
};

/// The debounce window for filesystem event bursts.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// The reactive loop around the selector and scheduler.
pub struct WatchLoop<'a> {
    config: &'a Config,
    graph: &'a RunGraph,
    caches: &'a CacheSet,
    select_opts: SelectOpts,
    exec_opts: ExecOpts,
}

impl<'a> WatchLoop<'a> {
    pub fn new(
        config: &'a Config,
        graph: &'a RunGraph,
        caches: &'a CacheSet,
        select_opts: SelectOpts,
        exec_opts: ExecOpts,
    ) -> Self {
        Self {
            config,
            graph,
            caches,
            select_opts,
            exec_opts,
        }
    }

    /// Run until cancelled. Never returns on its own.
    #[instrument(skip_all)]
    pub async fn run(&self, sink: &Sink, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let (event_tx, event_rx) = flume::unbounded::<Vec<RepoPath>>();

        // The debouncer callback runs on notify's thread; it relativizes
        // and filters paths before anything crosses into the async world.
        let repo = self.config.repo.clone();
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let paths: Vec<RepoPath> = events
                        .into_iter()
                        .filter_map(|event| repo.relativize(&event.path))
                        .filter(|path| !is_state_path(path))
                        .collect();
                    if !paths.is_empty() {
                        let _ = event_tx.send(paths);
                    }
                }
                Err(errors) => warn!(?errors, "watch errors"),
            }
        })
        .context("create debouncer")?;
        debouncer
            .watcher()
            .watch(self.config.repo.root(), RecursiveMode::Recursive)
            .context("watch repository root")?;

        // First pass runs the full selection; afterwards, only what changed.
        self.tick(sink, cancel.clone(), None).await?;

        loop {
            let mut batch: BTreeSet<RepoPath> = tokio::select! {
                paths = event_rx.recv_async() => {
                    paths.context("watcher thread stopped")?.into_iter().collect()
                }
                _ = wait_cancelled(&mut cancel) => return Ok(()),
            };
            // Coalesce everything that accumulated while we were waiting or
            // running.
            while let Ok(more) = event_rx.try_recv() {
                batch.extend(more);
            }

            debug!(changed = batch.len(), "watch tick");
            self.tick(sink, cancel.clone(), Some(batch)).await?;

            if *cancel.borrow() {
                return Ok(());
            }
        }
    }

    async fn tick(
        &self,
        sink: &Sink,
        cancel: watch::Receiver<bool>,
        changed: Option<BTreeSet<RepoPath>>,
    ) -> Result<()> {
        // Fresh per tick: the tracked-file memo and fingerprint memo must
        // observe the new tree state.
        let source = HashSource::new(self.config.repo.clone(), self.config.pydist.clone());
        let resolver = Resolver::new(self.config, self.graph, &source);

        // The first pass honors `--since` the way a plain invocation would;
        // later ticks use the watched change set instead.
        let changed = match (changed, &self.select_opts.since) {
            (Some(changed), _) => Some(changed),
            (None, Some(since)) => Some(source.changed_since(since).await?),
            (None, None) => None,
        };
        let selection =
            select_with_changed(self.graph, &resolver, self.caches, &self.select_opts, changed)
                .await?;
        if selection.is_empty() {
            return Ok(());
        }

        sink.note(format!("watch: running {} runnable(s)", selection.len()));
        let scheduler = Scheduler::new(self.config, self.graph, self.caches);
        let report = scheduler
            .run(&selection, &resolver, sink, cancel, &self.exec_opts)
            .await?;
        if report.failed() {
            sink.note("watch: run finished with failures");
        }
        Ok(())
    }
}

fn is_state_path(path: &RepoPath) -> bool {
    let first = path.as_str().split('/').next().unwrap_or_default();
    first == ".git" || first == PRIVATE_DIR || first == TRACKED_DIR
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
