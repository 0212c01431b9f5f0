//! End-to-end cache behavior through the scheduler.

use pretty_assertions::assert_eq;

use qik::runnable::Slug;
use qik::sched::{ExecOpts, Status};
use qik::select::SelectOpts;

use crate::TestRepo;

const LOCK_CONFIG: &str = r#"
[commands.lock]
exec = "printf ok > out.txt"
deps = ["in.txt"]
artifacts = ["out.txt"]
cache = "local"
"#;

#[test_log::test(tokio::test)]
async fn second_run_replays_from_cache() {
    let repo = TestRepo::new(LOCK_CONFIG, &[("in.txt", "a")]);
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("lock", None, None);

    let report = engine
        .run(&["lock"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Success { cached: false })
    );
    assert_eq!(repo.read("out.txt"), "ok");

    // Remove the artifact; the cached replay restores it byte-identically.
    std::fs::remove_file(repo.root().join("out.txt")).unwrap();
    let report = engine
        .run(&["lock"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(report.status(&slug), Some(&Status::Success { cached: true }));
    assert_eq!(repo.read("out.txt"), "ok");
}

#[test_log::test(tokio::test)]
async fn glob_change_invalidates() {
    let repo = TestRepo::new(LOCK_CONFIG, &[("in.txt", "a")]);
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("lock", None, None);

    engine
        .run(&["lock"], &SelectOpts::default(), &ExecOpts::default())
        .await;

    // Changing a matched file's working-tree content changes the
    // fingerprint; the next run misses and re-executes.
    repo.write("in.txt", "b");
    let report = engine
        .run(&["lock"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Success { cached: false })
    );
}

#[tokio::test]
async fn force_bypasses_lookup_but_still_stores() {
    let repo = TestRepo::new(
        r#"
        [commands.stamp]
        exec = "od -An -N8 -tx8 /dev/urandom > stamp.txt"
        deps = ["in.txt"]
        artifacts = ["stamp.txt"]
        cache = "local"
        "#,
        &[("in.txt", "a")],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("stamp", None, None);

    engine
        .run(&["stamp"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    let first = repo.read("stamp.txt");

    let forced = ExecOpts {
        force: true,
        ..Default::default()
    };
    let report = engine.run(&["stamp"], &SelectOpts::default(), &forced).await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Success { cached: false })
    );
    let second = repo.read("stamp.txt");
    assert_ne!(first, second);

    // Entries are immutable, so the entry from the first run is still the
    // one a plain invocation replays.
    let report = engine
        .run(&["stamp"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(report.status(&slug), Some(&Status::Success { cached: true }));
    assert_eq!(repo.read("stamp.txt"), first);
}

#[tokio::test]
async fn never_policy_stores_nothing() {
    let repo = TestRepo::new(
        r#"
        [commands.lock]
        exec = "printf ok > out.txt"
        deps = ["in.txt"]
        cache = "local"
        cache-when = "never"
        "#,
        &[("in.txt", "a")],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("lock", None, None);

    engine
        .run(&["lock"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    // Both runs execute; nothing was ever stored.
    let report = engine
        .run(&["lock"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Success { cached: false })
    );
    assert!(!repo.root().join("._qik/cache/lock").exists());
}

#[tokio::test]
async fn failure_is_not_stored_under_success_policy() {
    let repo = TestRepo::new(
        r#"
        [commands.flaky]
        exec = "exit 5"
        deps = ["in.txt"]
        cache = "local"
        "#,
        &[("in.txt", "a")],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("flaky", None, None);

    let report = engine
        .run(&["flaky"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Failure {
            exit_code: 5,
            cached: false
        })
    );

    // Re-runs keep executing: the failure never entered the cache.
    let report = engine
        .run(&["flaky"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Failure {
            exit_code: 5,
            cached: false
        })
    );
}

#[tokio::test]
async fn finished_policy_replays_failures() {
    let repo = TestRepo::new(
        r#"
        [commands.flaky]
        exec = "exit 5"
        deps = ["in.txt"]
        cache = "local"
        cache-when = "finished"
        "#,
        &[("in.txt", "a")],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("flaky", None, None);

    engine
        .run(&["flaky"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    let report = engine
        .run(&["flaky"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(
        report.status(&slug),
        Some(&Status::Failure {
            exit_code: 5,
            cached: true
        })
    );
}

#[tokio::test]
async fn repo_cache_stores_manifest_only() {
    let repo = TestRepo::new(
        r#"
        [commands.lint]
        exec = "echo clean"
        deps = ["in.txt"]
        cache = "repo"
        "#,
        &[("in.txt", "a")],
    );
    let engine = repo.load().await.unwrap();
    let slug = Slug::new("lint", None, None);

    engine
        .run(&["lint"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    let report = engine
        .run(&["lint"], &SelectOpts::default(), &ExecOpts::default())
        .await;
    assert_eq!(report.status(&slug), Some(&Status::Success { cached: true }));

    // The tracked entry exists, with the gitattributes rule installed.
    assert!(repo.root().join(".qik/cache/lint").exists());
    assert!(
        repo.read(".qik/.gitattributes")
            .contains("merge=qik-cache")
    );
}
