//! The declarative configuration: `qik.toml`.
//!
//! Parsing happens in two stages. [`ConfigFile`] is the raw serde model of
//! the TOML document; [`Config`] is the resolved, immutable value the rest of
//! the engine works against (spaces with concrete module paths, commands with
//! defaults applied, plugin commands injected). The resolved configuration is
//! threaded through the components explicitly; there is no process-wide
//! state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    ctx::{Ctx, VarDef, VarType},
    error::Error,
    plugin::Registry,
    repo::{Repo, RepoPath},
};

/// When a terminal run is stored in the cache.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CachePolicy {
    /// Store only when the runnable exits zero.
    #[default]
    Success,
    /// Store on any terminal exit.
    Finished,
    /// Store even on externally-signaled termination.
    Always,
    /// Never store.
    Never,
}

impl CachePolicy {
    /// Whether a terminal run is stored. `signaled` marks termination by an
    /// external signal (including cancellation) rather than a normal exit.
    pub fn stores(self, exit_code: i32, signaled: bool) -> bool {
        match self {
            CachePolicy::Never => false,
            CachePolicy::Success => !signaled && exit_code == 0,
            CachePolicy::Finished => !signaled,
            CachePolicy::Always => true,
        }
    }
}

/// The raw `qik.toml` document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub commands: BTreeMap<String, CommandConf>,
    #[serde(default)]
    pub spaces: BTreeMap<String, SpaceConf>,
    #[serde(default)]
    pub caches: BTreeMap<String, CacheConf>,
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
    /// `[ctx.PROFILE.NAMESPACE]` tables: profile -> namespace -> key -> value.
    #[serde(default)]
    pub ctx: BTreeMap<String, BTreeMap<String, toml::Table>>,
    #[serde(default)]
    pub vars: Vec<VarConf>,
    #[serde(default)]
    pub base: BaseConf,
    #[serde(default)]
    pub pydist: PydistConf,
}

/// A `[commands.NAME]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CommandConf {
    pub exec: String,
    #[serde(default)]
    pub deps: Vec<DepConf>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub cache_when: Option<CachePolicy>,
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default)]
    pub isolated: Option<bool>,
}

/// A declared dependency: either a bare glob string or a tagged table.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum DepConf {
    Glob(String),
    Tagged(TaggedDepConf),
    /// A table whose `type` tag is not built in; routed to the registry's
    /// dep variants at expansion.
    Custom(toml::Table),
}

/// The table form of a dependency.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum TaggedDepConf {
    Glob {
        pattern: String,
    },
    Const {
        value: String,
    },
    Pydist {
        name: String,
    },
    Command {
        name: String,
        #[serde(default)]
        strict: bool,
        #[serde(default)]
        isolated: Option<bool>,
    },
    /// A plugin-emitted lock dependency: the referenced command produces a
    /// lockfile artifact whose content feeds the fingerprint.
    Lock {
        command: String,
    },
}

/// A `[spaces.NAME]` section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SpaceConf {
    #[serde(default)]
    pub venv: Option<VenvConf>,
    #[serde(default)]
    pub dotenv: Vec<String>,
    #[serde(default)]
    pub modules: Vec<ModuleConf>,
    #[serde(default)]
    pub fence: Vec<String>,
    #[serde(default)]
    pub root: Option<String>,
}

/// A module entry: a bare path, or a table naming it explicitly.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ModuleConf {
    Path(String),
    Detailed {
        name: Option<String>,
        path: String,
    },
}

/// A virtualenv declaration: a bare requirements file, or the table form.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum VenvConf {
    Reqs(String),
    Detailed {
        #[serde(rename = "type", default = "default_venv_type")]
        ty: String,
        reqs: Vec<String>,
        #[serde(default)]
        lock: Option<String>,
    },
}

fn default_venv_type() -> String {
    String::from("uv")
}

/// A `[caches.NAME]` section. Backend-specific keys stay opaque here; the
/// registry's factory for `type` interprets them.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConf {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(flatten)]
    pub rest: toml::Table,
}

/// A `vars = [...]` entry.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum VarConf {
    Name(String),
    Detailed {
        name: String,
        #[serde(rename = "type", default)]
        ty: VarType,
        #[serde(default)]
        default: Option<toml::Value>,
        #[serde(default)]
        required: bool,
    },
}

/// The `[base]` section: dependencies prepended to every runnable.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BaseConf {
    #[serde(default)]
    pub deps: Vec<DepConf>,
}

/// The `[pydist]` section: distribution version resolution.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PydistConf {
    /// Configured override map, consulted before any metadata.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    /// A `requirements.txt`-style lockfile to fall back to.
    #[serde(default)]
    pub lock_file: Option<String>,
    /// Suppress `MissingDist` errors; missing versions contribute a sentinel.
    #[serde(default)]
    pub ignore_missing: bool,
}

/// A resolved command definition.
#[derive(Clone, Debug)]
pub struct CommandDef {
    pub name: String,
    pub exec: String,
    pub deps: Vec<DepConf>,
    pub artifacts: Vec<String>,
    pub cache: Option<String>,
    pub cache_when: CachePolicy,
    pub space: Option<String>,
    /// Default `isolated` flag for edges that reference this command.
    pub isolated: Option<bool>,
}

impl CommandDef {
    fn from_conf(name: &str, conf: &CommandConf) -> Self {
        Self {
            name: name.to_string(),
            exec: conf.exec.clone(),
            deps: conf.deps.clone(),
            artifacts: conf.artifacts.clone(),
            cache: conf.cache.clone(),
            cache_when: conf.cache_when.unwrap_or_default(),
            space: conf.space.clone(),
            isolated: conf.isolated,
        }
    }
}

/// A resolved module within a space.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Module {
    pub name: String,
    pub dir: RepoPath,
}

/// A resolved virtualenv declaration.
#[derive(Clone, Debug)]
pub struct VenvDef {
    pub ty: String,
    pub reqs: Vec<RepoPath>,
    pub lock: Option<RepoPath>,
}

impl VenvDef {
    /// The files whose content pins the environment: the lockfile when there
    /// is one, the requirements files otherwise.
    pub fn pin_files(&self) -> Vec<RepoPath> {
        match &self.lock {
            Some(lock) => vec![lock.clone()],
            None => self.reqs.clone(),
        }
    }
}

/// A resolved space: an isolation unit pairing a virtualenv, dotenv files,
/// and a set of modules.
#[derive(Clone, Debug)]
pub struct Space {
    pub name: String,
    pub venv: Option<VenvDef>,
    pub dotenv: Vec<RepoPath>,
    pub modules: Vec<Module>,
    pub fence: Vec<String>,
    pub root: Option<RepoPath>,
}

/// The resolved configuration: an immutable value threaded through the
/// components.
#[derive(Clone, Debug)]
pub struct Config {
    pub repo: Repo,
    pub commands: BTreeMap<String, CommandDef>,
    pub spaces: BTreeMap<String, Space>,
    pub caches: BTreeMap<String, CacheConf>,
    pub base_deps: Vec<DepConf>,
    pub pydist: PydistConf,
    pub ctx: Arc<Ctx>,
}

impl Config {
    /// Load and resolve the configuration for a discovered repository.
    ///
    /// `profile` is the active context profile; plugin commands registered by
    /// the plugins named in `[plugins]` are injected into the command set
    /// here.
    #[instrument(skip(registry))]
    pub async fn load(repo: Repo, registry: &Registry, profile: Option<&str>) -> Result<Config> {
        let path = repo.config_path();
        let raw = crate::fs::must_read_buffered_utf8(&path)
            .await
            .context("read configuration")?;
        let file: ConfigFile = toml::from_str(&raw).map_err(|err| Error::ConfigParse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::resolve(repo, file, registry, profile)
    }

    /// Resolve a parsed document. Split from [`Config::load`] so tests can
    /// feed documents directly.
    pub fn resolve(
        repo: Repo,
        file: ConfigFile,
        registry: &Registry,
        profile: Option<&str>,
    ) -> Result<Config> {
        let mut commands: BTreeMap<String, CommandDef> = file
            .commands
            .iter()
            .map(|(name, conf)| (name.clone(), CommandDef::from_conf(name, conf)))
            .collect();

        let spaces = file
            .spaces
            .iter()
            .map(|(name, conf)| Ok((name.clone(), resolve_space(name, conf)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        for space in spaces.values() {
            if let Some(venv) = &space.venv {
                if !registry.has_venv_type(&venv.ty) {
                    return Err(Error::PluginImport {
                        path: venv.ty.clone(),
                        message: String::from("no venv variant registered under this type"),
                    }
                    .into());
                }
            }
        }

        // Plugins contribute commands (and backend variants through the
        // registry) before expansion ever sees the command set.
        for (name, path) in &file.plugins {
            let plugin = registry.plugin(path).ok_or_else(|| Error::UnknownPlugin {
                path: path.clone(),
            })?;
            for def in plugin.commands(name, &spaces) {
                debug!(command = %def.name, plugin = %name, "plugin command");
                commands.insert(def.name.clone(), def);
            }
        }

        // The uv venv variant is active for any space declaring a `uv`
        // virtualenv, whether or not `[plugins]` names it.
        if !file.plugins.values().any(|path| path == "qik.uv") {
            if let Some(plugin) = registry.plugin("qik.uv") {
                for def in plugin.commands("uv", &spaces) {
                    debug!(command = %def.name, "implicit venv command");
                    commands.entry(def.name.clone()).or_insert(def);
                }
            }
        }

        let ctx = Ctx::new(
            profile,
            &file.ctx,
            project_vars(&file.vars)?,
            plugin_namespaces(&file.plugins),
        )?;

        Ok(Config {
            repo,
            commands,
            spaces,
            caches: file.caches,
            base_deps: file.base.deps,
            pydist: file.pydist,
            ctx: Arc::new(ctx),
        })
    }

    /// Look up a command definition, failing with the selection-phase error.
    pub fn command(&self, name: &str) -> Result<&CommandDef> {
        self.commands.get(name).ok_or_else(|| {
            Error::UnknownCommand {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Look up a space.
    pub fn space(&self, name: &str) -> Option<&Space> {
        self.spaces.get(name)
    }

    /// All (space, module) pairs in scope for a command, honoring its space
    /// pin.
    pub fn scope(&self, def: &CommandDef) -> Vec<(&Space, &Module)> {
        self.spaces
            .values()
            .filter(|space| match &def.space {
                Some(pinned) => &space.name == pinned,
                None => true,
            })
            .flat_map(|space| space.modules.iter().map(move |module| (space, module)))
            .collect()
    }
}

fn resolve_space(name: &str, conf: &SpaceConf) -> Result<Space> {
    let modules = conf
        .modules
        .iter()
        .map(|module| {
            let (name, path) = match module {
                ModuleConf::Path(path) => (None, path.as_str()),
                ModuleConf::Detailed { name, path } => (name.as_deref(), path.as_str()),
            };
            let dir = RepoPath::new(path)?;
            let name = name
                .map(String::from)
                .or_else(|| {
                    dir.as_str()
                        .rsplit('/')
                        .next()
                        .map(String::from)
                })
                .unwrap_or_else(|| dir.as_str().to_string());
            Ok(Module { name, dir })
        })
        .collect::<Result<Vec<_>>>()?;

    let venv = conf
        .venv
        .as_ref()
        .map(|venv| -> Result<VenvDef> {
            let (ty, reqs, lock) = match venv {
                VenvConf::Reqs(reqs) => (default_venv_type(), vec![reqs.clone()], None),
                VenvConf::Detailed { ty, reqs, lock } => (ty.clone(), reqs.clone(), lock.clone()),
            };
            Ok(VenvDef {
                ty,
                reqs: reqs.iter().map(RepoPath::new).collect::<Result<_>>()?,
                lock: lock.as_deref().map(RepoPath::new).transpose()?,
            })
        })
        .transpose()?;

    Ok(Space {
        name: name.to_string(),
        venv,
        dotenv: conf
            .dotenv
            .iter()
            .map(RepoPath::new)
            .collect::<Result<_>>()?,
        modules,
        fence: conf.fence.clone(),
        root: conf.root.as_deref().map(RepoPath::new).transpose()?,
    })
}

fn project_vars(vars: &[VarConf]) -> Result<Vec<VarDef>> {
    vars.iter()
        .map(|var| match var {
            VarConf::Name(name) => Ok(VarDef {
                name: name.clone(),
                ty: VarType::Str,
                default: None,
                required: false,
            }),
            VarConf::Detailed {
                name,
                ty,
                default,
                required,
            } => Ok(VarDef {
                name: name.clone(),
                ty: *ty,
                default: default.as_ref().map(toml_value_to_string),
                required: *required,
            }),
        })
        .collect()
}

fn plugin_namespaces(plugins: &BTreeMap<String, String>) -> BTreeSet<String> {
    plugins.keys().cloned().collect()
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case(CachePolicy::Success, 0, false, true; "success stores clean exits")]
    #[test_case(CachePolicy::Success, 1, false, false; "success skips failures")]
    #[test_case(CachePolicy::Success, 0, true, false; "success skips signaled exits")]
    #[test_case(CachePolicy::Finished, 1, false, true; "finished stores failures")]
    #[test_case(CachePolicy::Finished, 0, true, false; "finished skips signaled exits")]
    #[test_case(CachePolicy::Always, 1, true, true; "always stores signaled exits")]
    #[test_case(CachePolicy::Never, 0, false, false; "never stores nothing")]
    #[test]
    fn policy_gates_stores(policy: CachePolicy, exit_code: i32, signaled: bool, expect: bool) {
        pretty_assertions::assert_eq!(policy.stores(exit_code, signaled), expect);
    }

    fn registry() -> Registry {
        Registry::builtin()
    }

    fn repo() -> Repo {
        Repo::at("/tmp/qik-test")
    }

    fn parse(doc: &str) -> ConfigFile {
        toml::from_str(doc).expect("parse config document")
    }

    #[test]
    fn minimal_command() {
        let file = parse(
            r#"
            [commands.lock]
            exec = "printf ok > out.txt"
            deps = ["in.txt"]
            artifacts = ["out.txt"]
            cache = "local"
            "#,
        );
        let config = Config::resolve(repo(), file, &registry(), None).unwrap();
        let def = config.command("lock").unwrap();
        assert_eq!(def.exec, "printf ok > out.txt");
        assert_eq!(def.cache_when, CachePolicy::Success);
        assert!(matches!(&def.deps[0], DepConf::Glob(g) if g == "in.txt"));
    }

    #[test]
    fn tagged_deps_parse() {
        let file = parse(
            r#"
            [commands.b]
            exec = "echo B"
            deps = [
                { type = "command", name = "a", strict = true },
                { type = "const", value = "x" },
                { type = "pydist", name = "ruff" },
            ]
            "#,
        );
        let config = Config::resolve(repo(), file, &registry(), None).unwrap();
        let deps = &config.command("b").unwrap().deps;
        assert!(matches!(
            &deps[0],
            DepConf::Tagged(TaggedDepConf::Command { name, strict: true, isolated: None }) if name == "a"
        ));
        assert!(matches!(
            &deps[1],
            DepConf::Tagged(TaggedDepConf::Const { value }) if value == "x"
        ));
        assert!(matches!(
            &deps[2],
            DepConf::Tagged(TaggedDepConf::Pydist { name }) if name == "ruff"
        ));
    }

    #[test]
    fn spaces_resolve_modules() {
        let file = parse(
            r#"
            [spaces.default]
            venv = "requirements.txt"
            modules = ["libs/a", { name = "bee", path = "libs/b" }]
            dotenv = [".env"]
            "#,
        );
        let config = Config::resolve(repo(), file, &registry(), None).unwrap();
        let space = config.space("default").unwrap();
        assert_eq!(space.modules[0].name, "a");
        assert_eq!(space.modules[1].name, "bee");
        assert_eq!(space.modules[1].dir.as_str(), "libs/b");
        let venv = space.venv.as_ref().unwrap();
        assert_eq!(venv.ty, "uv");
        assert_eq!(venv.pin_files()[0].as_str(), "requirements.txt");
    }

    #[test]
    fn unknown_command_is_typed() {
        let config = Config::resolve(repo(), ConfigFile::default(), &registry(), None).unwrap();
        let err = config.command("nope").unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "conf4");
    }

    #[test]
    fn unknown_plugin_fails() {
        let file = parse(
            r#"
            [plugins]
            pkg = "not.a.plugin"
            "#,
        );
        let err = Config::resolve(repo(), file, &registry(), None).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "conf3");
    }

    #[test]
    fn scope_honors_space_pin() {
        let file = parse(
            r#"
            [commands.fmt]
            exec = "fmt {module.dir}"
            space = "web"

            [spaces.web]
            modules = ["apps/site"]

            [spaces.tools]
            modules = ["tools/x"]
            "#,
        );
        let config = Config::resolve(repo(), file, &registry(), None).unwrap();
        let def = config.command("fmt").unwrap();
        let scope = config.scope(def);
        assert_eq!(scope.len(), 1);
        assert_eq!(scope[0].1.dir.as_str(), "apps/site");
    }
}
