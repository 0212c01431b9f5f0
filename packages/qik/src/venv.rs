//! Spaces and their virtualenvs.
//!
//! A space pairs a virtualenv, dotenv files, and a set of modules. This
//! module owns the execution-environment composition for a space and the
//! built-in `uv` virtualenv plugin, which injects the install (and
//! optionally lock) runnables that keep the environment in sync before
//! anything in the space runs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use color_eyre::{Result, eyre::Context};
use itertools::Itertools;
use tracing::instrument;

use crate::{
    config::{CachePolicy, CommandDef, DepConf, Space, TaggedDepConf},
    plugin::Plugin,
    repo::Repo,
};

/// The prefix of every command the venv plugin injects.
const VENV_COMMAND_PREFIX: &str = "venv.";

/// The name of the install command for a space.
pub fn install_command(space: &str) -> String {
    format!("venv.install.{space}")
}

/// The name of the lock command for a space.
pub fn lock_command(space: &str) -> String {
    format!("venv.lock.{space}")
}

/// Whether a command was injected by a venv plugin. Injected commands do not
/// themselves receive an install dependency.
pub fn is_venv_command(name: &str) -> bool {
    name.starts_with(VENV_COMMAND_PREFIX)
}

/// The dependency injected into every runnable of a space with a managed
/// virtualenv: a soft ordering edge on the space's install runnable.
pub fn injected_dep(space: &Space) -> Option<DepConf> {
    space.venv.as_ref()?;
    Some(DepConf::Tagged(TaggedDepConf::Command {
        name: install_command(&space.name),
        strict: false,
        isolated: Some(true),
    }))
}

/// The managed virtualenv directory for a space.
pub fn venv_dir(repo: &Repo, space: &Space) -> Option<PathBuf> {
    space.venv.as_ref().map(|_| repo.venv_dir(&space.name))
}

/// The environment additions for running inside a space: the virtualenv
/// activation variables, then the dotenv files, later wins.
#[instrument(skip(repo, space), fields(space = %space.name))]
pub async fn space_env(repo: &Repo, space: &Space) -> Result<Vec<(String, String)>> {
    let mut env = Vec::new();

    if let Some(venv) = venv_dir(repo, space) {
        let bin = venv.join("bin");
        let path = match std::env::var("PATH") {
            Ok(existing) => format!("{}:{existing}", bin.display()),
            Err(_) => bin.display().to_string(),
        };
        env.push((String::from("VIRTUAL_ENV"), venv.display().to_string()));
        env.push((String::from("PATH"), path));
    }

    for dotenv in &space.dotenv {
        let path = dotenv.to_abs(repo.root());
        if !crate::fs::exists(&path).await {
            continue;
        }
        let vars = dotenvy::from_path_iter(&path)
            .with_context(|| format!("read dotenv file {dotenv}"))?;
        for var in vars {
            let (key, value) = var.with_context(|| format!("parse dotenv file {dotenv}"))?;
            env.push((key, value));
        }
    }

    Ok(env)
}

/// The built-in `uv` virtualenv plugin.
///
/// For every space with a `uv` virtualenv it contributes an install command
/// that materializes the environment from the space's pin files, and a lock
/// command when the space declares a lockfile.
pub struct UvPlugin;

impl Plugin for UvPlugin {
    fn path(&self) -> &'static str {
        "qik.uv"
    }

    fn commands(&self, _name: &str, spaces: &BTreeMap<String, Space>) -> Vec<CommandDef> {
        spaces
            .values()
            .filter(|space| {
                space
                    .venv
                    .as_ref()
                    .is_some_and(|venv| venv.ty == "uv")
            })
            .flat_map(uv_commands)
            .collect()
    }
}

fn uv_commands(space: &Space) -> Vec<CommandDef> {
    let venv = space.venv.as_ref().expect("space has a venv");
    let venv_path = format!("._qik/venv/{}", space.name);
    let mut commands = Vec::new();

    // Lock first: the install command depends on its artifact when present.
    if let Some(lock) = &venv.lock {
        let reqs = venv.reqs.iter().map(|req| req.as_str()).join(" ");
        commands.push(CommandDef {
            name: lock_command(&space.name),
            exec: format!("uv pip compile {reqs} -o {lock}"),
            deps: venv.reqs.iter().map(|req| DepConf::Glob(req.as_str().to_string())).collect(),
            artifacts: vec![lock.as_str().to_string()],
            cache: Some(String::from("repo")),
            cache_when: CachePolicy::Success,
            space: Some(space.name.clone()),
            isolated: None,
        });
    }

    let pins = venv.pin_files();
    let pin_args = pins.iter().map(|pin| pin.as_str()).join(" ");
    let deps = match &venv.lock {
        Some(_) => vec![DepConf::Tagged(TaggedDepConf::Lock {
            command: lock_command(&space.name),
        })],
        None => pins
            .iter()
            .map(|pin| DepConf::Glob(pin.as_str().to_string()))
            .collect(),
    };
    commands.push(CommandDef {
        name: install_command(&space.name),
        exec: format!(
            "uv venv --allow-existing {venv_path} && VIRTUAL_ENV={venv_path} uv pip sync {pin_args}"
        ),
        deps,
        artifacts: vec![],
        cache: Some(String::from("local")),
        cache_when: CachePolicy::Success,
        space: Some(space.name.clone()),
        isolated: None,
    });

    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenvDef;
    use crate::repo::RepoPath;
    use pretty_assertions::assert_eq;

    fn space(lock: Option<&str>) -> Space {
        Space {
            name: String::from("default"),
            venv: Some(VenvDef {
                ty: String::from("uv"),
                reqs: vec![RepoPath::new("requirements.txt").unwrap()],
                lock: lock.map(|l| RepoPath::new(l).unwrap()),
            }),
            dotenv: vec![],
            modules: vec![],
            fence: vec![],
            root: None,
        }
    }

    #[test]
    fn install_only_without_lock() {
        let spaces = BTreeMap::from([(String::from("default"), space(None))]);
        let commands = UvPlugin.commands("uv", &spaces);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "venv.install.default");
        assert!(commands[0].exec.contains("uv pip sync requirements.txt"));
        assert!(matches!(
            &commands[0].deps[0],
            DepConf::Glob(glob) if glob == "requirements.txt"
        ));
    }

    #[test]
    fn lockfile_adds_lock_command() {
        let spaces = BTreeMap::from([(String::from("default"), space(Some("uv.lock")))]);
        let commands = UvPlugin.commands("uv", &spaces);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "venv.lock.default");
        assert_eq!(commands[0].artifacts, vec![String::from("uv.lock")]);
        assert!(matches!(
            &commands[1].deps[0],
            DepConf::Tagged(TaggedDepConf::Lock { command }) if command == "venv.lock.default"
        ));
    }

    #[test]
    fn injected_dep_targets_install() {
        let dep = injected_dep(&space(None)).unwrap();
        assert!(matches!(
            dep,
            DepConf::Tagged(TaggedDepConf::Command { name, strict: false, isolated: Some(true) })
                if name == "venv.install.default"
        ));
    }
}
