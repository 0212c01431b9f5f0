//! The invocation flow: discover, load, expand, select, then list, run, or
//! watch.

use color_eyre::{Result, eyre::Context};
use colored::Colorize;
use tokio::sync::watch;
use tracing::{debug, warn};

use qik::cache::{CacheSet, LocalCache};
use qik::config::Config;
use qik::expand;
use qik::graph::RunGraph;
use qik::out::SinkDriver;
use qik::plugin::Registry;
use qik::repo::Repo;
use qik::resolve::Resolver;
use qik::sched::{ExecOpts, Scheduler};
use qik::select::{SelectOpts, Selection, select};
use qik::source::HashSource;
use qik::watch::WatchLoop;

use crate::Args;

pub async fn exec(args: Args) -> Result<i32> {
    // Merge driver mode: keep the current side. Entries are immutable and
    // the acting party's cache is authoritative for the current head, so
    // leaving CURRENT untouched is the whole job.
    if args.merge_cache.is_some() {
        return Ok(0);
    }

    let cwd = std::env::current_dir().context("get working directory")?;
    let repo = Repo::discover(&cwd)?;
    let registry = Registry::builtin();
    let config = Config::load(repo, &registry, args.profile.as_deref()).await?;

    let runnables = expand::expand(&config, &registry)?;
    let graph = RunGraph::build(runnables)?;
    let caches = CacheSet::build(&config, &registry)?;
    let source = HashSource::new(config.repo.clone(), config.pydist.clone());
    let resolver = Resolver::new(&config, &graph, &source);

    if args.prune {
        prune_local(&config, &graph).await?;
    }

    let select_opts = SelectOpts {
        names: args.names.clone(),
        modules: args.modules.clone(),
        spaces: args.spaces.clone(),
        cache_type: args.cache_type.clone(),
        cache_status: args.cache_status,
        since: args.since.clone(),
        isolated: args.isolated,
    };
    let exec_opts = ExecOpts {
        workers: args.workers.unwrap_or_else(num_workers),
        force: args.force,
        cache_override: args.cache.clone(),
        cache_when_override: args.cache_when,
    };

    let selection = select(&graph, &resolver, &caches, &source, &select_opts).await?;
    debug!(selected = selection.len(), "selection computed");

    if args.ls {
        return list(&selection, args.fail);
    }

    if selection.is_empty() {
        println!("nothing selected");
        return Ok(0);
    }

    // Interrupts flip the cancel signal; the scheduler winds down
    // cooperatively from there.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    if args.watch {
        let driver = SinkDriver::start(args.verbosity, 0);
        let sink = driver.sink();
        let watcher = WatchLoop::new(&config, &graph, &caches, select_opts, exec_opts);
        let result = watcher.run(&sink, cancel_rx).await;
        drop(sink);
        driver.close().await;
        result?;
        return Ok(0);
    }

    let driver = SinkDriver::start(args.verbosity, selection.len() as u64);
    let sink = driver.sink();
    let scheduler = Scheduler::new(&config, &graph, &caches);
    let report = scheduler
        .run(&selection, &resolver, &sink, cancel_rx, &exec_opts)
        .await;
    drop(sink);
    driver.close().await;
    let report = report?;

    if report.cancelled {
        warn!("run cancelled");
        return Ok(1);
    }
    Ok(if report.failed() { 1 } else { 0 })
}

/// `--ls`: print the selection, one slug per line, transitive runnables
/// dimmed. Never executes anything.
fn list(selection: &Selection, fail: bool) -> Result<i32> {
    for slug in selection.slugs() {
        if selection.is_primary(slug) {
            println!("{slug}");
        } else {
            println!("{}", format!("{slug} (transitive)").dimmed());
        }
    }
    if fail && !selection.is_empty() {
        return Ok(1);
    }
    Ok(0)
}

/// Drop local cache entries whose slug no longer expands from the current
/// configuration.
async fn prune_local(config: &Config, graph: &RunGraph) -> Result<()> {
    let cache = LocalCache::new("local", config.repo.local_cache_dir());
    for slug in cache.slugs().await? {
        let known = graph
            .runnables()
            .slugs()
            .any(|existing| existing.as_str() == slug);
        if !known {
            debug!(%slug, "pruning stale cache entries");
            cache.remove_slug(&slug).await?;
        }
    }
    Ok(())
}

fn num_workers() -> usize {
    num_cpus::get()
}
