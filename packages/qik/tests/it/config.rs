//! Configuration loading against real files.

use pretty_assertions::assert_eq;

use qik::config::{CachePolicy, Config};
use qik::error::Error;
use qik::plugin::Registry;
use qik::repo::Repo;

use crate::TestRepo;

#[tokio::test]
async fn full_document_loads() {
    let repo = TestRepo::new(
        r#"
        vars = ["owner", { name = "retries", type = "int", default = 2 }]

        [base]
        deps = ["qik.toml"]

        [commands.lint]
        exec = "ruff check {module.dir}"
        deps = ["{module.dir}/**.py", { type = "pydist", name = "ruff" }]
        cache = "repo"
        cache-when = "finished"

        [spaces.default]
        venv = "requirements.txt"
        dotenv = [".env"]
        modules = ["libs/a", { name = "bee", path = "libs/b" }]

        [caches.shared]
        type = "dir"
        path = "/srv/qik-cache"

        [ctx.default.qik]
        workers = 4

        [pydist]
        ignore-missing = true
        "#,
        &[("requirements.txt", "ruff==0.6.2\n")],
    );
    let engine = repo.load().await.unwrap();

    let lint = engine.config.command("lint").unwrap();
    assert_eq!(lint.cache_when, CachePolicy::Finished);
    assert_eq!(lint.cache.as_deref(), Some("repo"));

    let space = engine.config.space("default").unwrap();
    assert_eq!(space.modules[1].name, "bee");
    assert!(space.venv.is_some());

    // The venv plugin contributed the install command implicitly.
    assert!(engine.config.command("venv.install.default").is_ok());

    // The configured dir cache exists beside the two built-ins.
    let names: Vec<&str> = engine.caches.names().collect();
    assert_eq!(names, vec!["local", "repo", "shared"]);

    assert_eq!(engine.config.ctx.render("qik", "workers").unwrap(), "4");
    assert_eq!(
        engine.config.ctx.render("project", "retries").unwrap(),
        "2"
    );
}

#[tokio::test]
async fn parse_errors_are_typed() {
    let repo = TestRepo::new("this is not toml [", &[]);
    let err = repo.load().await.unwrap_err();
    let err = err.downcast_ref::<Error>().unwrap();
    assert_eq!(err.code(), "conf1");
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn missing_config_is_typed() {
    let dir = tempfile::tempdir().unwrap();
    let err = Repo::discover(dir.path()).unwrap_err();
    assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "conf0");
}

#[tokio::test]
async fn unknown_profile_fails_at_load() {
    let repo = TestRepo::new(
        r#"
        [commands.a]
        exec = "echo A"

        [ctx.ci.qik]
        workers = 8
        "#,
        &[],
    );
    let registry = Registry::builtin();
    let config = Config::load(Repo::at(repo.root()), &registry, Some("ci")).await;
    assert!(config.is_ok());

    let err = Config::load(Repo::at(repo.root()), &registry, Some("staging"))
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "conf6");
}

#[tokio::test]
async fn env_override_beats_profile() {
    let repo = TestRepo::new(
        r#"
        vars = ["arch"]

        [ctx.default.project]
        arch = "x86_64"
        "#,
        &[],
    );
    let engine = repo.load().await.unwrap();
    assert_eq!(engine.config.ctx.render("project", "arch").unwrap(), "x86_64");

    // SAFETY: tests in this binary that read PROJECT__ARCH run serially
    // within this test; the variable is removed before returning.
    unsafe {
        std::env::set_var("PROJECT__ARCH", "aarch64");
    }
    let value = engine.config.ctx.render("project", "arch");
    unsafe {
        std::env::remove_var("PROJECT__ARCH");
    }
    assert_eq!(value.unwrap(), "aarch64");
}
