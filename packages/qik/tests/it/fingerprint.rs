//! Fingerprint determinism and sensitivity against a real git worktree.

use pretty_assertions::{assert_eq, assert_ne};

use qik::resolve::Resolver;
use qik::runnable::Slug;

use crate::TestRepo;

const CONFIG: &str = r#"
[commands.test]
exec = "pytest"
deps = ["src/**.py"]
"#;

#[tokio::test]
async fn independent_resolvers_agree() {
    let repo = TestRepo::new(CONFIG, &[("src/a.py", "print('a')\n")]);
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("test", None, None);

    let source = engine.source();
    let first = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();

    let source = engine.source();
    let second = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn working_tree_edits_change_the_fingerprint() {
    let repo = TestRepo::new(CONFIG, &[("src/a.py", "print('a')\n")]);
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("test", None, None);

    let source = engine.source();
    let before = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();

    // An uncommitted edit to a matched file is visible immediately: hashes
    // come from the working tree, not the index.
    repo.write("src/a.py", "print('changed')\n");
    let source = engine.source();
    let after = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();
    assert_ne!(before, after);
}

#[tokio::test]
async fn untracked_files_are_invisible() {
    let repo = TestRepo::new(CONFIG, &[("src/a.py", "print('a')\n")]);
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("test", None, None);

    let source = engine.source();
    let before = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();

    // A new file matching the glob but outside the index contributes
    // nothing until it is tracked.
    repo.write("src/new.py", "print('new')\n");
    let source = engine.source();
    let untracked = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();
    assert_eq!(before, untracked);

    repo.commit_all("track new file");
    let source = engine.source();
    let tracked = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();
    assert_ne!(before, tracked);
}

#[tokio::test]
async fn unrelated_files_do_not_contribute() {
    let repo = TestRepo::new(
        CONFIG,
        &[("src/a.py", "print('a')\n"), ("README.md", "docs\n")],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("test", None, None);

    let source = engine.source();
    let before = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();

    repo.write("README.md", "different docs\n");
    let source = engine.source();
    let after = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn dist_version_feeds_the_fingerprint() {
    let config = r#"
    [commands.typecheck]
    exec = "mypy"
    deps = [{ type = "pydist", name = "mypy" }]

    [pydist]
    versions = { mypy = "1.10.0" }
    "#;
    let repo = TestRepo::new(config, &[]);
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("typecheck", None, None);

    let source = engine.source();
    let pinned = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();

    let bumped = config.replace("1.10.0", "1.11.0");
    repo.write("qik.toml", &bumped);
    let engine = repo.load().await.unwrap();
    let source = engine.source();
    let after = Resolver::new(&engine.config, &engine.graph, &source)
        .fingerprint(&slug)
        .await
        .unwrap();
    assert_ne!(pinned, after);
}
