//! The parallel scheduler.
//!
//! A single coordinator owns the DAG state and wakes on worker events
//! delivered over a bounded channel; workers are tokio tasks gated by a
//! semaphore sized to the worker count. A runnable spawns once every
//! selected upstream is terminal; failures propagate `UpstreamFailed` along
//! hard (isolated=false) edges without halting the rest of the run.
//!
//! Per runnable: cache lookup happens-before subprocess spawn happens-before
//! exit happens-before cache write happens-before the completion event.
//! Cancellation is cooperative: the coordinator observes the cancel signal,
//! marks pending work skipped, and each worker signals its child, waits a
//! bounded grace period, then kills it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{Result, eyre::Context};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, instrument, warn};

use crate::{
    cache::{CacheBackend, CacheSet, RunResult},
    config::{CachePolicy, Config},
    graph::RunGraph,
    hash::Fingerprint,
    out::{Outcome, Sink},
    repo::Repo,
    resolve::Resolver,
    runnable::{Runnable, Slug},
    select::Selection,
    source,
    venv,
};

/// How long a cancelled child gets to exit before being killed.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Execution options for one scheduler run.
#[derive(Clone, Debug)]
pub struct ExecOpts {
    pub workers: usize,
    /// Bypass cache lookup; stores still happen per policy.
    pub force: bool,
    /// Override the assigned cache for every selected runnable.
    pub cache_override: Option<String>,
    /// Override the cache policy for every selected runnable.
    pub cache_when_override: Option<CachePolicy>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            force: false,
            cache_override: None,
            cache_when_override: None,
        }
    }
}

/// The lifecycle of a selected runnable.
#[derive(Clone, Eq, PartialEq, Debug, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Status {
    Pending,
    /// Spawned, waiting on a worker slot.
    Ready,
    Running,
    Success {
        cached: bool,
    },
    Failure {
        exit_code: i32,
        cached: bool,
    },
    Skipped,
    UpstreamFailed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success { .. } | Status::Failure { .. } | Status::Skipped | Status::UpstreamFailed
        )
    }
}

/// The outcome of a scheduler run.
#[derive(Clone, Debug)]
pub struct Report {
    pub statuses: BTreeMap<Slug, Status>,
    pub cancelled: bool,
}

impl Report {
    /// Whether the process should exit non-zero: any selected runnable
    /// failed or was blocked by a failure.
    pub fn failed(&self) -> bool {
        self.statuses
            .values()
            .any(|status| matches!(status, Status::Failure { .. } | Status::UpstreamFailed))
    }

    pub fn status(&self, slug: &Slug) -> Option<&Status> {
        self.statuses.get(slug)
    }
}

enum WorkerEvent {
    Started(Slug),
    Done(Slug, Status),
}

/// The scheduler for one repository.
pub struct Scheduler<'a> {
    config: &'a Config,
    graph: &'a RunGraph,
    caches: &'a CacheSet,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &'a Config, graph: &'a RunGraph, caches: &'a CacheSet) -> Self {
        Self {
            config,
            graph,
            caches,
        }
    }

    /// Execute the selection. Fingerprints are computed up front; cache
    /// policy and the DAG drive per-runnable decisions from there.
    #[instrument(skip_all, fields(selected = selection.len(), workers = opts.workers))]
    pub async fn run(
        &self,
        selection: &Selection,
        resolver: &Resolver<'_>,
        sink: &Sink,
        mut cancel: watch::Receiver<bool>,
        opts: &ExecOpts,
    ) -> Result<Report> {
        let fingerprints = resolver
            .fingerprint_all(selection.slugs().cloned())
            .await?;

        let mut statuses: BTreeMap<Slug, Status> = selection
            .slugs()
            .map(|slug| (slug.clone(), Status::Pending))
            .collect();

        let semaphore = Arc::new(Semaphore::new(opts.workers.max(1)));
        let (tx, rx) = flume::bounded::<WorkerEvent>(opts.workers.max(1));
        let mut is_cancelled = false;

        loop {
            if statuses.values().all(Status::is_terminal) {
                break;
            }

            if !is_cancelled {
                self.spawn_ready(
                    &mut statuses,
                    &fingerprints,
                    selection,
                    &semaphore,
                    &tx,
                    sink,
                    &cancel,
                    opts,
                )
                .await?;
            }

            if statuses.values().all(Status::is_terminal) {
                break;
            }

            tokio::select! {
                event = rx.recv_async() => {
                    let event = event.context("worker channel closed")?;
                    match event {
                        WorkerEvent::Started(slug) => {
                            statuses.insert(slug, Status::Running);
                        }
                        WorkerEvent::Done(slug, status) => {
                            debug!(%slug, %status, "runnable terminal");
                            if matches!(status, Status::Failure { .. }) {
                                self.poison_downstream(&slug, &mut statuses, selection, sink);
                            }
                            statuses.insert(slug, status);
                        }
                    }
                }
                _ = wait_cancelled(&mut cancel), if !is_cancelled => {
                    is_cancelled = true;
                    for (slug, status) in statuses.iter_mut() {
                        if *status == Status::Pending {
                            *status = Status::Skipped;
                            sink.finished(slug, Outcome::Skipped);
                        }
                    }
                }
            }
        }

        Ok(Report {
            statuses,
            cancelled: is_cancelled,
        })
    }

    /// Spawn every runnable whose selected upstreams are all terminal.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_ready(
        &self,
        statuses: &mut BTreeMap<Slug, Status>,
        fingerprints: &BTreeMap<Slug, Fingerprint>,
        selection: &Selection,
        semaphore: &Arc<Semaphore>,
        tx: &flume::Sender<WorkerEvent>,
        sink: &Sink,
        cancel: &watch::Receiver<bool>,
        opts: &ExecOpts,
    ) -> Result<()> {
        let ready: Vec<Slug> = statuses
            .iter()
            .filter(|(slug, status)| {
                **status == Status::Pending
                    && self
                        .graph
                        .upstreams(slug)
                        .iter()
                        .filter(|(upstream, _)| selection.contains(upstream))
                        .all(|(upstream, _)| {
                            statuses
                                .get(upstream)
                                .map(Status::is_terminal)
                                .unwrap_or(true)
                        })
            })
            .map(|(slug, _)| slug.clone())
            .collect();

        for slug in ready {
            let runnable = self.graph.runnable(&slug)?.clone();
            let fingerprint = fingerprints
                .get(&slug)
                .expect("selected runnables are fingerprinted")
                .clone();

            let cache_name = opts
                .cache_override
                .clone()
                .or_else(|| runnable.cache.clone());
            let cache = cache_name
                .as_deref()
                .map(|name| self.caches.get(name).cloned())
                .transpose()?;
            let policy = opts.cache_when_override.unwrap_or(runnable.cache_when);

            let env = match runnable
                .space
                .as_deref()
                .and_then(|name| self.config.space(name))
            {
                Some(space) => venv::space_env(&self.config.repo, space).await?,
                None => vec![],
            };

            statuses.insert(slug.clone(), Status::Ready);
            let worker = Worker {
                runnable,
                fingerprint,
                cache,
                policy,
                force: opts.force,
                env,
                repo: self.config.repo.clone(),
                sink: sink.clone(),
                cancel: cancel.clone(),
            };
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closes");
                let slug = worker.runnable.slug.clone();
                let _ = tx.send_async(WorkerEvent::Started(slug.clone())).await;
                let status = worker.execute().await;
                let _ = tx.send_async(WorkerEvent::Done(slug, status)).await;
            });
        }
        Ok(())
    }

    /// Mark everything downstream of a failure along hard edges.
    fn poison_downstream(
        &self,
        failed: &Slug,
        statuses: &mut BTreeMap<Slug, Status>,
        selection: &Selection,
        sink: &Sink,
    ) {
        let mut queue = vec![failed.clone()];
        while let Some(slug) = queue.pop() {
            for (downstream, meta) in self.graph.downstreams(&slug) {
                if meta.isolated || !selection.contains(downstream) {
                    continue;
                }
                if statuses.get(downstream) == Some(&Status::Pending) {
                    statuses.insert(downstream.clone(), Status::UpstreamFailed);
                    sink.finished(downstream, Outcome::UpstreamFailed);
                    queue.push(downstream.clone());
                }
            }
        }
    }
}

/// One runnable's execution, from cache lookup to terminal status.
struct Worker {
    runnable: Arc<Runnable>,
    fingerprint: Fingerprint,
    cache: Option<Arc<dyn CacheBackend>>,
    policy: CachePolicy,
    force: bool,
    env: Vec<(String, String)>,
    repo: Repo,
    sink: Sink,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    #[instrument(skip(self), fields(slug = %self.runnable.slug))]
    async fn execute(mut self) -> Status {
        let slug = self.runnable.slug.clone();

        // Workers poll the cancel flag before doing anything; a task that
        // was queued behind a slot when the interrupt arrived never starts.
        if *self.cancel.borrow() {
            self.sink.finished(&slug, Outcome::Skipped);
            return Status::Skipped;
        }

        if !self.force && self.policy != CachePolicy::Never {
            if let Some(cache) = &self.cache {
                match cache.get(&slug, &self.fingerprint).await {
                    Ok(Some(hit)) => {
                        self.sink.started(&slug, true);
                        for line in hit.out.split_inclusive(|byte| *byte == b'\n') {
                            self.sink.line(&slug, line);
                        }
                        if let Err(err) = self.write_log(&hit.out).await {
                            warn!(?err, "could not write log file");
                        }
                        let outcome = if hit.exit_code == 0 {
                            Outcome::Success { cached: true }
                        } else {
                            Outcome::Failure {
                                exit_code: hit.exit_code,
                                cached: true,
                            }
                        };
                        self.sink.finished(&slug, outcome);
                        return if hit.exit_code == 0 {
                            Status::Success { cached: true }
                        } else {
                            Status::Failure {
                                exit_code: hit.exit_code,
                                cached: true,
                            }
                        };
                    }
                    Ok(None) => {}
                    // Lookup failures degrade to a miss.
                    Err(err) => warn!(?err, "cache lookup failed, treating as miss"),
                }
            }
        }

        self.sink.started(&slug, false);
        let (exit_code, signaled, out) = match self.spawn_and_wait().await {
            Ok(result) => result,
            Err(err) => {
                self.sink.note(format!("{slug}: {err:#}"));
                self.sink.finished(
                    &slug,
                    Outcome::Failure {
                        exit_code: 127,
                        cached: false,
                    },
                );
                return Status::Failure {
                    exit_code: 127,
                    cached: false,
                };
            }
        };

        if let Err(err) = self.write_log(&out).await {
            warn!(?err, "could not write log file");
        }

        // The store is sequenced after the subprocess has fully exited and
        // its output is flushed. Store failures degrade to a warning.
        if let Some(cache) = &self.cache {
            if self.policy.stores(exit_code, signaled) {
                match source::working_files(&self.repo, &self.runnable.artifacts).await {
                    Ok(artifacts) => {
                        let run = RunResult {
                            exit_code,
                            out: out.clone(),
                            artifacts,
                        };
                        if let Err(err) = cache.put(&slug, &self.fingerprint, &run).await {
                            warn!(?err, "cache store failed");
                        }
                    }
                    Err(err) => warn!(?err, "could not collect artifacts"),
                }
            }
        }

        let outcome = if exit_code == 0 && !signaled {
            Outcome::Success { cached: false }
        } else {
            Outcome::Failure {
                exit_code,
                cached: false,
            }
        };
        self.sink.finished(&slug, outcome);
        if exit_code == 0 && !signaled {
            Status::Success { cached: false }
        } else {
            Status::Failure {
                exit_code,
                cached: false,
            }
        }
    }

    /// Run the shell string, streaming combined output to the sink while
    /// buffering it for the log file and the cache.
    async fn spawn_and_wait(&mut self) -> Result<(i32, bool, Vec<u8>)> {
        let (shell, flag) = shell_command();
        let mut child = tokio::process::Command::new(shell)
            .arg(flag)
            .arg(&self.runnable.exec)
            .current_dir(self.repo.root())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("spawn shell")?;

        let (line_tx, line_rx) = flume::bounded::<Vec<u8>>(64);
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        tokio::spawn(pump_lines(stdout, line_tx.clone()));
        tokio::spawn(pump_lines(stderr, line_tx));

        let collector = tokio::spawn({
            let sink = self.sink.clone();
            let slug = self.runnable.slug.clone();
            async move {
                let mut out = Vec::new();
                while let Ok(line) = line_rx.recv_async().await {
                    sink.line(&slug, &line);
                    out.extend_from_slice(&line);
                }
                out
            }
        });

        let mut cancel = self.cancel.clone();
        let status = tokio::select! {
            status = child.wait() => Some(status.context("wait for child")?),
            _ = wait_cancelled(&mut cancel) => None,
        };

        let (exit_code, signaled) = match status {
            Some(status) => (status.code().unwrap_or(-1), status.code().is_none()),
            None => {
                terminate(&child);
                let status =
                    match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
                        Ok(status) => status.context("wait for child")?,
                        Err(_) => {
                            child.start_kill().context("kill child")?;
                            child.wait().await.context("wait for killed child")?
                        }
                    };
                (status.code().unwrap_or(-1), true)
            }
        };

        let out = collector.await.context("join output collector")?;
        Ok((exit_code, signaled, out))
    }

    async fn write_log(&self, out: &[u8]) -> Result<()> {
        let path = self.log_path();
        crate::fs::write(&path, out).await
    }

    fn log_path(&self) -> PathBuf {
        self.repo
            .out_dir()
            .join(format!("{}.log", self.runnable.slug))
    }
}

/// Resolve when the cancel signal is raised; pends forever if it never can
/// be.
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

async fn pump_lines(reader: impl AsyncRead + Unpin, tx: flume::Sender<Vec<u8>>) {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send_async(line).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn shell_command() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

/// Politely ask the child to stop before escalation.
#[cfg(unix)]
fn terminate(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &tokio::process::Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSet;
    use crate::plugin::Registry;
    use crate::select::{SelectOpts, select};
    use crate::source::HashSource;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        graph: RunGraph,
        source: HashSource,
        caches: CacheSet,
    }

    fn fixture(doc: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::at(dir.path());
        let file = toml::from_str(doc).unwrap();
        let config = Config::resolve(repo.clone(), file, &Registry::builtin(), None).unwrap();
        let graph = RunGraph::build(crate::expand::expand(&config, &Registry::builtin()).unwrap()).unwrap();
        let source = HashSource::new(repo, Default::default());
        let caches = CacheSet::build(&config, &Registry::builtin()).unwrap();
        Fixture {
            _dir: dir,
            config,
            graph,
            source,
            caches,
        }
    }

    async fn run(fixture: &Fixture, names: &[&str], opts: ExecOpts) -> Report {
        let resolver = Resolver::new(&fixture.config, &fixture.graph, &fixture.source);
        let selection = select(
            &fixture.graph,
            &resolver,
            &fixture.caches,
            &fixture.source,
            &SelectOpts {
                names: names.iter().map(ToString::to_string).collect(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let driver = crate::out::SinkDriver::start(0, 0);
        let sink = driver.sink();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let scheduler = Scheduler::new(&fixture.config, &fixture.graph, &fixture.caches);
        let report = scheduler
            .run(&selection, &resolver, &sink, cancel_rx, &opts)
            .await
            .unwrap();
        drop(sink);
        driver.close().await;
        report
    }

    #[tokio::test]
    async fn upstream_runs_before_downstream() {
        let fixture = fixture(
            r#"
            [commands.a]
            exec = "printf a >> order.txt"

            [commands.b]
            exec = "printf b >> order.txt"
            deps = [{ type = "command", name = "a" }]
            "#,
        );
        let report = run(&fixture, &["b"], ExecOpts::default()).await;
        assert!(!report.failed());

        let order =
            std::fs::read_to_string(fixture.config.repo.root().join("order.txt")).unwrap();
        assert_eq!(order, "ab");
    }

    #[tokio::test]
    async fn hard_edge_failure_poisons_downstream() {
        let fixture = fixture(
            r#"
            [commands.bad]
            exec = "exit 3"

            [commands.after]
            exec = "touch after.txt"
            deps = [{ type = "command", name = "bad", isolated = false }]
            "#,
        );
        let report = run(&fixture, &["after"], ExecOpts::default()).await;
        assert!(report.failed());
        assert_eq!(
            report.status(&Slug::new("after", None, None)),
            Some(&Status::UpstreamFailed)
        );
        assert!(!fixture.config.repo.root().join("after.txt").exists());
    }

    #[tokio::test]
    async fn soft_edge_failure_does_not_block() {
        let fixture = fixture(
            r#"
            [commands.bad]
            exec = "exit 3"

            [commands.after]
            exec = "touch after.txt"
            deps = [{ type = "command", name = "bad" }]
            "#,
        );
        let report = run(&fixture, &["after"], ExecOpts::default()).await;
        // The run still fails overall, but the downstream executed.
        assert!(report.failed());
        assert_eq!(
            report.status(&Slug::new("after", None, None)),
            Some(&Status::Success { cached: false })
        );
        assert!(fixture.config.repo.root().join("after.txt").exists());
    }

    #[tokio::test]
    async fn log_file_captures_output() {
        let fixture = fixture(
            r#"
            [commands.hello]
            exec = "echo hello world"
            "#,
        );
        let report = run(&fixture, &["hello"], ExecOpts::default()).await;
        assert!(!report.failed());

        let log = fixture.config.repo.out_dir().join("hello.log");
        let content = std::fs::read_to_string(log).unwrap();
        assert_eq!(content, "hello world\n");
    }

    #[tokio::test]
    async fn parallel_fanout_completes() {
        let fixture = fixture(
            r#"
            [commands.fmt]
            exec = "touch {module.dir}/.ok"

            [spaces.default]
            modules = ["libs/a", "libs/b", "libs/c"]
            "#,
        );
        for module in ["a", "b", "c"] {
            std::fs::create_dir_all(fixture.config.repo.root().join("libs").join(module))
                .unwrap();
        }
        let report = run(
            &fixture,
            &["fmt"],
            ExecOpts {
                workers: 3,
                ..Default::default()
            },
        )
        .await;
        assert!(!report.failed());
        for module in ["a", "b", "c"] {
            assert!(
                fixture
                    .config
                    .repo
                    .root()
                    .join("libs")
                    .join(module)
                    .join(".ok")
                    .exists()
            );
        }
    }

    #[tokio::test]
    async fn cancellation_skips_pending() {
        let fixture = fixture(
            r#"
            [commands.slow]
            exec = "sleep 30"

            [commands.next]
            exec = "touch next.txt"
            deps = [{ type = "command", name = "slow" }]
            "#,
        );
        let resolver = Resolver::new(&fixture.config, &fixture.graph, &fixture.source);
        let selection = select(
            &fixture.graph,
            &resolver,
            &fixture.caches,
            &fixture.source,
            &SelectOpts {
                names: vec![String::from("next")],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let driver = crate::out::SinkDriver::start(0, 0);
        let sink = driver.sink();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cancel_tx.send(true);
        });

        let scheduler = Scheduler::new(&fixture.config, &fixture.graph, &fixture.caches);
        let report = scheduler
            .run(&selection, &resolver, &sink, cancel_rx, &ExecOpts::default())
            .await
            .unwrap();
        drop(sink);
        driver.close().await;

        assert!(report.cancelled);
        assert_eq!(
            report.status(&Slug::new("next", None, None)),
            Some(&Status::Skipped)
        );
        assert!(!fixture.config.repo.root().join("next.txt").exists());
    }
}
