//! DAG ordering, isolation, cycle rejection, and selection flows.

use pretty_assertions::assert_eq;

use qik::error::Error;
use qik::graph::RunGraph;
use qik::plugin::Registry;
use qik::resolve::Resolver;
use qik::runnable::Slug;
use qik::sched::{ExecOpts, Status};
use qik::select::{CacheStatus, SelectOpts, select};

use crate::TestRepo;

#[test_log::test(tokio::test)]
async fn command_dependency_orders_execution() {
    let repo = TestRepo::new(
        r#"
        [commands.a]
        exec = "printf A >> order.txt"
        deps = ["x.txt"]

        [commands.b]
        exec = "printf B >> order.txt"
        deps = [{ type = "command", name = "a" }]
        "#,
        &[("x.txt", "x")],
    );
    let engine = repo.load().await.unwrap();

    let report = engine
        .run(&["b"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert!(!report.failed());
    assert_eq!(
        report.status(&Slug::new("a", None, None)),
        Some(&Status::Success { cached: false })
    );
    assert_eq!(repo.read("order.txt"), "AB");

    // --isolated runs only b.
    std::fs::remove_file(repo.root().join("order.txt")).unwrap();
    let opts = SelectOpts {
        isolated: true,
        ..Default::default()
    };
    let report = engine.run(&["b"], &opts, &ExecOpts::default()).await;
    assert!(!report.failed());
    assert_eq!(report.status(&Slug::new("a", None, None)), None);
    assert_eq!(repo.read("order.txt"), "B");
}

#[tokio::test]
async fn cycles_are_rejected_before_anything_runs() {
    let repo = TestRepo::new(
        r#"
        [commands.a]
        exec = "touch a.txt"
        deps = [{ type = "command", name = "b" }]

        [commands.b]
        exec = "touch b.txt"
        deps = [{ type = "command", name = "a" }]
        "#,
        &[],
    );
    let err = repo.load().await.unwrap_err();
    let err = err.downcast_ref::<Error>().unwrap();
    assert_eq!(err.code(), "graph0");
    assert_eq!(err.exit_code(), 2);
    let message = err.to_string();
    assert!(message.contains('a') && message.contains('b'));

    assert!(!repo.root().join("a.txt").exists());
    assert!(!repo.root().join("b.txt").exists());
}

#[tokio::test]
async fn since_selects_strict_downstream() {
    let repo = TestRepo::new(
        r#"
        [commands.test]
        exec = "echo testing"
        deps = ["**.py"]

        [commands.coverage]
        exec = "echo coverage"
        deps = [{ type = "command", name = "test", strict = true }]

        [commands.unrelated]
        exec = "echo unrelated"
        deps = ["docs/**.md"]
        "#,
        &[("app.py", "print('v1')\n"), ("docs/index.md", "# docs\n")],
    );
    let engine = repo.load().await.unwrap();

    // Modify one .py file in the working tree relative to HEAD.
    repo.write("app.py", "print('v2')\n");

    let source = engine.source();
    let resolver = Resolver::new(&engine.config, &engine.graph, &source);
    let opts = SelectOpts {
        since: Some(String::from("HEAD")),
        ..Default::default()
    };
    let selection = select(&engine.graph, &resolver, &engine.caches, &source, &opts)
        .await
        .unwrap();

    assert!(selection.is_primary(&Slug::new("test", None, None)));
    assert!(selection.contains(&Slug::new("coverage", None, None)));
    assert!(!selection.contains(&Slug::new("unrelated", None, None)));

    let report = engine.run(&[], &opts, &ExecOpts::default()).await;
    assert!(!report.failed());
    assert_eq!(
        report.status(&Slug::new("coverage", None, None)),
        Some(&Status::Success { cached: false })
    );
}

#[tokio::test]
async fn cache_status_probes_without_executing() {
    let repo = TestRepo::new(
        r#"
        [commands.fmt]
        exec = "touch {module.dir}/.ok"
        deps = ["{module.dir}/**.py"]
        cache = "local"

        [spaces.default]
        modules = ["libs/a", "libs/b", "libs/c"]
        "#,
        &[
            ("libs/a/mod.py", "a\n"),
            ("libs/b/mod.py", "b\n"),
            ("libs/c/mod.py", "c\n"),
        ],
    );
    let engine = repo.load().await.unwrap();

    // Everything is cold before the first run.
    let source = engine.source();
    let resolver = Resolver::new(&engine.config, &engine.graph, &source);
    let cold = SelectOpts {
        cache_status: Some(CacheStatus::Cold),
        ..Default::default()
    };
    let selection = select(&engine.graph, &resolver, &engine.caches, &source, &cold)
        .await
        .unwrap();
    assert_eq!(selection.len(), 3);
    // Probing stored nothing.
    assert!(!repo.root().join("._qik/cache").exists());

    let report = engine
        .run(
            &["fmt"],
            &SelectOpts::default(),
            &ExecOpts {
                workers: 3,
                ..Default::default()
            },
        )
        .await;
    assert!(!report.failed());
    for module in ["a", "b", "c"] {
        assert!(repo.root().join("libs").join(module).join(".ok").exists());
    }

    // Now everything is warm.
    let source = engine.source();
    let resolver = Resolver::new(&engine.config, &engine.graph, &source);
    let warm = SelectOpts {
        cache_status: Some(CacheStatus::Warm),
        ..Default::default()
    };
    let selection = select(&engine.graph, &resolver, &engine.caches, &source, &warm)
        .await
        .unwrap();
    assert_eq!(selection.len(), 3);
}

#[tokio::test]
async fn unknown_selection_name_is_a_selection_error() {
    let repo = TestRepo::new(
        r#"
        [commands.a]
        exec = "echo A"
        "#,
        &[],
    );
    let engine = repo.load().await.unwrap();

    let source = engine.source();
    let resolver = Resolver::new(&engine.config, &engine.graph, &source);
    let opts = SelectOpts {
        names: vec![String::from("nope")],
        ..Default::default()
    };
    let err = select(&engine.graph, &resolver, &engine.caches, &source, &opts)
        .await
        .unwrap_err();
    let err = err.downcast_ref::<Error>().unwrap();
    assert_eq!(err.code(), "conf4");
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn base_deps_apply_to_zero_dep_commands() {
    let repo = TestRepo::new(
        r#"
        [base]
        deps = ["qik.toml"]

        [commands.hello]
        exec = "echo hello"
        cache = "local"
        "#,
        &[],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("hello", None, None);

    engine
        .run(&["hello"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    let report = engine
        .run(&["hello"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(report.status(&slug), Some(&Status::Success { cached: true }));

    // A config edit flows through the base dep and invalidates.
    repo.write(
        "qik.toml",
        r#"
        [base]
        deps = ["qik.toml"]

        # comment changes the file content
        [commands.hello]
        exec = "echo hello"
        cache = "local"
        "#,
    );
    let engine = repo.load().await.unwrap();
    let report = engine
        .run(&["hello"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Success { cached: false })
    );
}

#[tokio::test]
async fn graph_topo_is_deterministic() {
    let repo = TestRepo::new(
        r#"
        [commands.z]
        exec = "echo z"

        [commands.m]
        exec = "echo m"

        [commands.a]
        exec = "echo a"
        "#,
        &[],
    );
    let engine = repo.load().await.unwrap();
    let order: Vec<String> = engine.graph.topo().iter().map(ToString::to_string).collect();
    assert_eq!(order, vec!["a", "m", "z"]);
    // Rebuilding produces the identical order.
    let rebuilt = RunGraph::build(qik::expand::expand(&engine.config, &Registry::builtin()).unwrap()).unwrap();
    let again: Vec<String> = rebuilt.topo().iter().map(ToString::to_string).collect();
    assert_eq!(order, again);
}
