//! The command expander: declarative definitions to concrete runnables.
//!
//! A command is parametric if any of its fields mentions a `{module...}` or
//! `{space}` placeholder. Module-parametric commands emit one runnable per
//! (space, module) pair in scope; space-parametric commands emit one per
//! space; everything else emits exactly one runnable. Placeholders are
//! substituted here, base dependencies are prepended, the venv install
//! dependency is injected, and command references are resolved to concrete
//! slugs.

use color_eyre::{Result, eyre::bail};
use lazy_regex::regex;
use tracing::instrument;

use crate::{
    config::{CommandDef, Config, DepConf, Module, Space, TaggedDepConf},
    ctx::Ctx,
    dep::{CommandDep, ConstDep, Dep, DistDep, GlobDep, LockDep},
    error::Error,
    plugin::Registry,
    runnable::{Runnable, RunnableSet, Slug},
    venv,
};

/// Expand the whole configuration into the runnable set.
#[instrument(skip(config, registry))]
pub fn expand(config: &Config, registry: &Registry) -> Result<RunnableSet> {
    let mut staged = Vec::new();
    for def in config.commands.values() {
        staged.extend(expand_command(config, registry, def)?);
    }

    let mut set = RunnableSet::default();
    for runnable in resolve_references(config, staged)? {
        set.insert(runnable);
    }
    Ok(set)
}

/// A runnable whose command references have not been resolved yet.
struct Staged {
    runnable: Runnable,
    unresolved: Vec<UnresolvedDep>,
}

enum UnresolvedDep {
    Command {
        index: usize,
        name: String,
        strict: bool,
        isolated: Option<bool>,
    },
    Lock {
        index: usize,
        command: String,
    },
}

fn expand_command(config: &Config, registry: &Registry, def: &CommandDef) -> Result<Vec<Staged>> {
    let over_module = is_module_parametric(def);
    let over_space = over_module || is_space_parametric(def);

    let mut out = Vec::new();
    if over_module {
        for (space, module) in config.scope(def) {
            out.push(instantiate(config, registry, def, Some(space), Some(module))?);
        }
    } else if over_space {
        for space in config.spaces.values().filter(|space| match &def.space {
            Some(pinned) => &space.name == pinned,
            None => true,
        }) {
            out.push(instantiate(config, registry, def, Some(space), None)?);
        }
    } else {
        let space = def.space.as_deref().and_then(|name| config.space(name));
        out.push(instantiate(config, registry, def, space, None)?);
    }
    Ok(out)
}

fn instantiate(
    config: &Config,
    registry: &Registry,
    def: &CommandDef,
    space: Option<&Space>,
    module: Option<&Module>,
) -> Result<Staged> {
    let ctx = &config.ctx;
    let subst = |input: &str| substitute(input, ctx, space, module);

    let slug = Slug::new(
        &def.name,
        space.map(|s| s.name.as_str()),
        module.map(|m| m.name.as_str()),
    );

    let mut deps = Vec::new();
    let mut unresolved = Vec::new();
    let declared = config.base_deps.iter().chain(def.deps.iter());
    for conf in declared {
        let index = deps.len();
        match conf {
            DepConf::Glob(pattern) => deps.push(Dep::Glob(GlobDep {
                pattern: subst(pattern)?,
            })),
            DepConf::Tagged(TaggedDepConf::Glob { pattern }) => deps.push(Dep::Glob(GlobDep {
                pattern: subst(pattern)?,
            })),
            DepConf::Tagged(TaggedDepConf::Const { value }) => deps.push(Dep::Const(ConstDep {
                value: subst(value)?,
            })),
            DepConf::Tagged(TaggedDepConf::Pydist { name }) => deps.push(Dep::Dist(DistDep {
                name: subst(name)?,
            })),
            DepConf::Tagged(TaggedDepConf::Command {
                name,
                strict,
                isolated,
            }) => {
                deps.push(Dep::Command(CommandDep {
                    name: name.clone(),
                    targets: vec![],
                    strict: *strict,
                    isolated: isolated.unwrap_or(true),
                }));
                unresolved.push(UnresolvedDep::Command {
                    index,
                    name: name.clone(),
                    strict: *strict,
                    isolated: *isolated,
                });
            }
            DepConf::Tagged(TaggedDepConf::Lock { command }) => {
                deps.push(Dep::Lock(LockDep {
                    command: command.clone(),
                    targets: vec![],
                    artifacts: vec![],
                }));
                unresolved.push(UnresolvedDep::Lock {
                    index,
                    command: command.clone(),
                });
            }
            DepConf::Custom(table) => {
                deps.push(registry.custom_dep(table, space, module)?);
            }
        }
    }

    // Runnables in a space with a managed virtualenv wait for its install
    // runnable, unless they are the venv plumbing itself.
    if !venv::is_venv_command(&def.name) {
        if let Some(dep) = space.and_then(venv::injected_dep) {
            if let DepConf::Tagged(TaggedDepConf::Command {
                name,
                strict,
                isolated,
            }) = dep
            {
                let index = deps.len();
                deps.push(Dep::Command(CommandDep {
                    name: name.clone(),
                    targets: vec![],
                    strict,
                    isolated: isolated.unwrap_or(true),
                }));
                unresolved.push(UnresolvedDep::Command {
                    index,
                    name,
                    strict,
                    isolated,
                });
            }
        }
    }

    let runnable = Runnable {
        slug,
        command: def.name.clone(),
        space: space.map(|s| s.name.clone()),
        module: module.map(|m| m.name.clone()),
        exec: subst(&def.exec)?,
        deps,
        artifacts: def
            .artifacts
            .iter()
            .map(|artifact| subst(artifact))
            .collect::<Result<_>>()?,
        cache: def.cache.clone(),
        cache_when: def.cache_when,
    };

    Ok(Staged {
        runnable,
        unresolved,
    })
}

/// Resolve command references against the full expansion.
fn resolve_references(config: &Config, staged: Vec<Staged>) -> Result<Vec<Runnable>> {
    let all: Vec<Runnable> = staged.iter().map(|s| s.runnable.clone()).collect();

    let mut resolved = Vec::with_capacity(staged.len());
    for mut entry in staged {
        for unresolved in &entry.unresolved {
            match unresolved {
                UnresolvedDep::Command {
                    index,
                    name,
                    strict,
                    isolated,
                } => {
                    let upstream = config.command(name)?;
                    let targets = matching_targets(&all, &entry.runnable, name);
                    entry.runnable.deps[*index] = Dep::Command(CommandDep {
                        name: name.clone(),
                        targets,
                        strict: *strict,
                        isolated: isolated.or(upstream.isolated).unwrap_or(true),
                    });
                }
                UnresolvedDep::Lock { index, command } => {
                    config.command(command)?;
                    let targets = matching_targets(&all, &entry.runnable, command);
                    let artifacts: Vec<String> = all
                        .iter()
                        .filter(|r| targets.contains(&r.slug))
                        .flat_map(|r| r.artifacts.iter().cloned())
                        .collect();
                    if artifacts.is_empty() {
                        return Err(Error::LockFileRequired {
                            command: command.clone(),
                        }
                        .into());
                    }
                    entry.runnable.deps[*index] = Dep::Lock(LockDep {
                        command: command.clone(),
                        targets,
                        artifacts,
                    });
                }
            }
        }
        resolved.push(entry.runnable);
    }
    Ok(resolved)
}

/// The upstream runnables a command reference resolves to: the matching
/// (space, module) expansion when one exists, then the same space, then
/// every expansion of the command.
fn matching_targets(all: &[Runnable], from: &Runnable, command: &str) -> Vec<Slug> {
    let candidates: Vec<&Runnable> = all.iter().filter(|r| r.command == command).collect();

    let exact: Vec<Slug> = candidates
        .iter()
        .filter(|r| r.space == from.space && r.module == from.module)
        .map(|r| r.slug.clone())
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    if from.space.is_some() {
        let same_space: Vec<Slug> = candidates
            .iter()
            .filter(|r| r.space == from.space)
            .map(|r| r.slug.clone())
            .collect();
        if !same_space.is_empty() {
            return same_space;
        }
    }

    candidates.iter().map(|r| r.slug.clone()).collect()
}

fn is_module_parametric(def: &CommandDef) -> bool {
    template_fields(def).any(|field| field.contains("{module."))
}

fn is_space_parametric(def: &CommandDef) -> bool {
    template_fields(def).any(|field| field.contains("{space}"))
}

fn template_fields(def: &CommandDef) -> impl Iterator<Item = &str> {
    let dep_fields = def.deps.iter().filter_map(|dep| match dep {
        DepConf::Glob(pattern) => Some(pattern.as_str()),
        DepConf::Tagged(TaggedDepConf::Glob { pattern }) => Some(pattern.as_str()),
        DepConf::Tagged(TaggedDepConf::Const { value }) => Some(value.as_str()),
        _ => None,
    });
    std::iter::once(def.exec.as_str())
        .chain(dep_fields)
        .chain(def.artifacts.iter().map(String::as_str))
}

/// Substitute every `{...}` placeholder in the input.
///
/// Recognized: `{module.dir}`, `{module.name}`, `{module.pyimport}`,
/// `{space}`, and `{ctx.NAMESPACE.NAME}`.
pub fn substitute(
    input: &str,
    ctx: &Ctx,
    space: Option<&Space>,
    module: Option<&Module>,
) -> Result<String> {
    let pattern = regex!(r"\{([a-zA-Z0-9_.\-]+)\}");

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for found in pattern.captures_iter(input) {
        let whole = found.get(0).expect("capture 0 always exists");
        let key = &found[1];
        out.push_str(&input[last..whole.start()]);
        last = whole.end();

        let value = match key {
            "space" => match space {
                Some(space) => space.name.clone(),
                None => bail!("{{space}} used outside a space"),
            },
            "module.dir" | "module.name" | "module.pyimport" => match module {
                Some(module) => match key {
                    "module.dir" => module.dir.as_str().to_string(),
                    "module.name" => module.name.clone(),
                    _ => module.dir.pyimport(),
                },
                None => bail!("{{{key}}} used outside a module scope"),
            },
            other => match other.strip_prefix("ctx.").and_then(|k| k.split_once('.')) {
                Some((namespace, name)) => ctx.render(namespace, name)?,
                None => bail!("unrecognized placeholder: {{{other}}}"),
            },
        };
        out.push_str(&value);
    }
    out.push_str(&input[last..]);
    Ok(out)
}
