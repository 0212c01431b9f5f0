//! The error taxonomy for `qik`.
//!
//! Every user-visible failure maps to one of the variants below. Each variant
//! carries a stable short identifier (used in diagnostics so users can look
//! the error up in the docs) and a coarse exit-code category:
//!
//! - `2`: configuration or selection errors; nothing executes.
//! - `1`: a selected runnable failed (or the run was interrupted).
//! - `3`: internal errors, including cache backend I/O that could not be
//!   degraded to a warning.
//!
//! Most code in the crate returns `color_eyre::Result`; fatal paths wrap one
//! of these variants into the report so the binary can downcast it and pick
//! the process exit code.

use derive_more::{Display, Error};
use enum_assoc::Assoc;

/// A typed, user-facing `qik` error.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error, Assoc)]
#[func(pub const fn code(&self) -> &'static str)]
#[func(pub const fn exit_code(&self) -> i32)]
pub enum Error {
    /// No `qik.toml` was found walking up from the starting directory.
    #[display("no qik.toml found above {start}")]
    #[assoc(code = "conf0")]
    #[assoc(exit_code = 2)]
    ConfigNotFound { start: String },

    /// The configuration file exists but could not be parsed.
    #[display("could not parse {path}: {message}")]
    #[assoc(code = "conf1")]
    #[assoc(exit_code = 2)]
    ConfigParse { path: String, message: String },

    /// A module name was referenced that no space defines.
    #[display("unknown module: {name}")]
    #[assoc(code = "conf2")]
    #[assoc(exit_code = 2)]
    UnknownModule { name: String },

    /// A `[plugins]` entry pointed at a module path that is not registered.
    #[display("unknown plugin: {path}")]
    #[assoc(code = "conf3")]
    #[assoc(exit_code = 2)]
    UnknownPlugin { path: String },

    /// A command name was referenced that the configuration does not define.
    #[display("unknown command: {name}")]
    #[assoc(code = "conf4")]
    #[assoc(exit_code = 2)]
    UnknownCommand { name: String },

    /// A cache name was referenced that the configuration does not define.
    #[display("unknown cache: {name}")]
    #[assoc(code = "conf5")]
    #[assoc(exit_code = 2)]
    UnknownCache { name: String },

    /// The requested context profile does not exist.
    #[display("unknown profile: {name}")]
    #[assoc(code = "conf6")]
    #[assoc(exit_code = 2)]
    UnknownProfile { name: String },

    /// A required context variable had no value from any source.
    #[display("required context variable {namespace}.{name} is not set")]
    #[assoc(code = "ctx0")]
    #[assoc(exit_code = 2)]
    CtxMissing { namespace: String, name: String },

    /// A context variable value could not be cast to its declared type.
    #[display("context variable {namespace}.{name}: cannot cast {value:?} to {ty}")]
    #[assoc(code = "ctx1")]
    #[assoc(exit_code = 2)]
    CtxTypeCast {
        namespace: String,
        name: String,
        value: String,
        ty: String,
    },

    /// A context lookup used a namespace that is not declared.
    #[display("unknown context namespace: {namespace}")]
    #[assoc(code = "ctx2")]
    #[assoc(exit_code = 2)]
    CtxNamespace { namespace: String },

    /// The declared dependencies imply a cycle.
    #[display("dependency cycle detected: {}", path.join(" -> "))]
    #[assoc(code = "graph0")]
    #[assoc(exit_code = 2)]
    CycleDetected { path: Vec<String> },

    /// A plugin module failed to load.
    #[display("could not import plugin {path}: {message}")]
    #[assoc(code = "plugin0")]
    #[assoc(exit_code = 2)]
    PluginImport { path: String, message: String },

    /// A `pydist` dependency could not be resolved to a version.
    #[display("distribution not found: {name}")]
    #[assoc(code = "dist0")]
    #[assoc(exit_code = 2)]
    MissingDist { name: String },

    /// A module's distribution could not be resolved to a version.
    #[display("distribution not found for module {module}: {name}")]
    #[assoc(code = "dist1")]
    #[assoc(exit_code = 2)]
    MissingModuleDist { module: String, name: String },

    /// A lock-style dependency requires the referenced command to declare a
    /// lockfile artifact.
    #[display("command {command} declares no lockfile artifact")]
    #[assoc(code = "dist2")]
    #[assoc(exit_code = 2)]
    LockFileRequired { command: String },

    /// A space was used in a way that requires a virtualenv, but none is
    /// configured for it.
    #[display("space {space} has no virtualenv configured")]
    #[assoc(code = "venv0")]
    #[assoc(exit_code = 2)]
    VenvNotConfigured { space: String },

    /// A runnable's subprocess exited non-zero.
    #[display("{slug} exited with code {exit_code}")]
    #[assoc(code = "run0")]
    #[assoc(exit_code = 1)]
    SubprocessFailed { slug: String, exit_code: i32 },

    /// A cache backend failed an I/O operation that could not be degraded.
    #[display("cache {name}: {message}")]
    #[assoc(code = "cache0")]
    #[assoc(exit_code = 3)]
    CacheIo { name: String, message: String },

    /// The remote side of a cache backend is unreachable.
    #[display("remote cache {name} unavailable: {message}")]
    #[assoc(code = "cache1")]
    #[assoc(exit_code = 3)]
    RemoteCacheUnavailable { name: String, message: String },

    /// The run was interrupted before completion.
    #[display("cancelled")]
    #[assoc(code = "run1")]
    #[assoc(exit_code = 1)]
    Cancelled,
}

impl Error {
    /// Render the error the way the CLI reports it: `error [code]: message`.
    pub fn diagnostic(&self) -> String {
        format!("error [{}]: {self}", self.code())
    }
}

/// Pick the process exit code for a fatal report.
///
/// Reports that wrap a typed [`Error`] use its category; anything else is an
/// internal error.
pub fn report_exit_code(report: &color_eyre::Report) -> i32 {
    report
        .downcast_ref::<Error>()
        .map(Error::exit_code)
        .unwrap_or(3)
}
