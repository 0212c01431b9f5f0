use std::path::Path;

use tempfile::TempDir;
use xshell::{Shell, cmd};

use qik::cache::CacheSet;
use qik::config::Config;
use qik::graph::RunGraph;
use qik::plugin::Registry;
use qik::repo::Repo;
use qik::resolve::Resolver;
use qik::sched::{ExecOpts, Report, Scheduler};
use qik::select::{SelectOpts, select};
use qik::source::HashSource;

pub mod caching;
pub mod config;
pub mod fingerprint;
pub mod flow;

/// A scratch repository: a git worktree with a `qik.toml` and some files,
/// committed so the hash source sees them.
pub struct TestRepo {
    // Held for cleanup.
    _dir: TempDir,
    root: std::path::PathBuf,
}

impl TestRepo {
    pub fn new(config: &str, files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("create temporary directory");
        let root = dir.path().canonicalize().expect("canonicalize temp dir");

        std::fs::write(root.join("qik.toml"), config).expect("write qik.toml");
        for (path, content) in files {
            let path = root.join(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("create parent dirs");
            }
            std::fs::write(path, content).expect("write file");
        }

        let sh = Shell::new().expect("create shell");
        sh.change_dir(&root);
        cmd!(sh, "git init -q").run().expect("git init");
        cmd!(sh, "git add .").run().expect("git add");
        cmd!(
            sh,
            "git -c user.name=qik -c user.email=qik@example.invalid commit -q -m init"
        )
        .run()
        .expect("git commit");

        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, path: &str, content: &str) {
        let path = self.root.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.root.join(path)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        let sh = Shell::new().expect("create shell");
        sh.change_dir(&self.root);
        cmd!(sh, "git add .").run().expect("git add");
        cmd!(
            sh,
            "git -c user.name=qik -c user.email=qik@example.invalid commit -q -m {message}"
        )
        .run()
        .expect("git commit");
    }

    pub async fn load(&self) -> color_eyre::Result<Engine> {
        let registry = Registry::builtin();
        let config = Config::load(Repo::at(&self.root), &registry, None).await?;
        let graph = RunGraph::build(qik::expand::expand(&config, &registry)?)?;
        let caches = CacheSet::build(&config, &registry)?;
        Ok(Engine {
            config,
            graph,
            caches,
        })
    }
}

/// Everything an invocation works with, built the way the binary builds it.
#[derive(Debug)]
pub struct Engine {
    pub config: Config,
    pub graph: RunGraph,
    pub caches: CacheSet,
}

impl Engine {
    pub fn source(&self) -> HashSource {
        HashSource::new(self.config.repo.clone(), self.config.pydist.clone())
    }

    /// Select by name and execute, the way `qik <names>` would.
    pub async fn run(&self, names: &[&str], opts: &SelectOpts, exec: &ExecOpts) -> Report {
        let source = self.source();
        let resolver = Resolver::new(&self.config, &self.graph, &source);
        let opts = SelectOpts {
            names: names.iter().map(ToString::to_string).collect(),
            ..opts.clone()
        };
        let selection = select(&self.graph, &resolver, &self.caches, &source, &opts)
            .await
            .expect("selection");

        let driver = qik::out::SinkDriver::start(0, 0);
        let sink = driver.sink();
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let scheduler = Scheduler::new(&self.config, &self.graph, &self.caches);
        let report = scheduler
            .run(&selection, &resolver, &sink, cancel_rx, exec)
            .await
            .expect("scheduler run");
        drop(sink);
        driver.close().await;
        report
    }
}
