//! Concrete dependencies: the resolved form each runnable carries.
//!
//! Every variant knows how to contribute to a fingerprint (see `resolve`)
//! and which DAG edges it imposes. The config-file forms live in `config`;
//! expansion substitutes template placeholders and resolves command
//! references into slugs before anything here is constructed.

use crate::runnable::Slug;

/// An edge a dependency imposes on the DAG, annotated with the declaring
/// dependency's flags.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DepEdge {
    pub upstream: Slug,
    /// Selection of the upstream pulls this runnable in too.
    pub strict: bool,
    /// `true` (the default) marks a soft ordering edge: `--isolated` drops
    /// the upstream, and an upstream failure does not poison this runnable.
    pub isolated: bool,
}

/// A resolved dependency of a runnable.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Dep {
    /// Tracked files matching a glob pattern, by content hash.
    Glob(GlobDep),
    /// A constant value contributed verbatim.
    Const(ConstDep),
    /// The installed version of a Python distribution.
    Dist(DistDep),
    /// One or more upstream runnables, by fingerprint.
    Command(CommandDep),
    /// A lockfile artifact produced by an upstream lock command.
    Lock(LockDep),
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct GlobDep {
    pub pattern: String,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ConstDep {
    pub value: String,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DistDep {
    pub name: String,
}

/// A dependency on another command. `targets` are the upstream runnables
/// this expansion resolved to: the matching (space, module) expansion when
/// the upstream is parametric, or every expansion otherwise.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CommandDep {
    pub name: String,
    pub targets: Vec<Slug>,
    pub strict: bool,
    pub isolated: bool,
}

/// A plugin-emitted lock dependency: contributes the lock command's
/// artifact globs to the fingerprint and imposes a strict edge on the lock
/// command itself.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LockDep {
    pub command: String,
    pub targets: Vec<Slug>,
    /// The lockfile artifact globs, taken from the lock command definition.
    pub artifacts: Vec<String>,
}

impl Dep {
    /// The DAG edges this dependency imposes.
    pub fn edges(&self) -> Vec<DepEdge> {
        match self {
            Dep::Glob(_) | Dep::Const(_) | Dep::Dist(_) => vec![],
            Dep::Command(dep) => dep
                .targets
                .iter()
                .map(|upstream| DepEdge {
                    upstream: upstream.clone(),
                    strict: dep.strict,
                    isolated: dep.isolated,
                })
                .collect(),
            Dep::Lock(dep) => dep
                .targets
                .iter()
                .map(|upstream| DepEdge {
                    upstream: upstream.clone(),
                    strict: true,
                    isolated: false,
                })
                .collect(),
        }
    }

    /// The glob patterns whose matching files feed this dependency's
    /// fingerprint contribution.
    pub fn glob_patterns(&self) -> Vec<String> {
        match self {
            Dep::Glob(dep) => vec![dep.pattern.clone()],
            Dep::Lock(dep) => dep.artifacts.clone(),
            Dep::Const(_) | Dep::Dist(_) | Dep::Command(_) => vec![],
        }
    }
}
