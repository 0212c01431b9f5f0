//! Context variables: `{ctx.NAMESPACE.NAME}` templates and their resolution.
//!
//! Resolution order, first non-absent wins:
//!
//! 1. the environment variable `NAMESPACE__NAME` (upper-cased),
//! 2. the active profile's `[ctx.PROFILE.NAMESPACE]` value,
//! 3. the variable's declared default,
//!
//! failing with `CtxMissing` if the variable is `required` and nothing
//! supplied a value. Lookups take an explicit handle; nothing here is
//! process-global except the environment itself.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::Result;
use serde::Deserialize;
use tracing::trace;

use crate::error::Error;

/// The implicit profile used when `-p` is not given.
pub const DEFAULT_PROFILE: &str = "default";

/// The namespace for `vars = [...]` declarations.
pub const PROJECT_NAMESPACE: &str = "project";

/// The namespace for qik's own options.
pub const QIK_NAMESPACE: &str = "qik";

/// The declared type of a context variable.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VarType {
    #[default]
    Str,
    Int,
    Bool,
}

/// A declared context variable.
#[derive(Clone, Debug)]
pub struct VarDef {
    pub name: String,
    pub ty: VarType,
    pub default: Option<String>,
    pub required: bool,
}

/// A resolved context value.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CtxValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl CtxValue {
    /// The string form used for template substitution.
    pub fn render(&self) -> String {
        match self {
            CtxValue::Str(value) => value.clone(),
            CtxValue::Int(value) => value.to_string(),
            CtxValue::Bool(value) => value.to_string(),
        }
    }
}

/// The context handle: profiles, declared variables, and namespace registry.
#[derive(Clone, Debug)]
pub struct Ctx {
    profile: String,
    /// profile -> namespace -> name -> raw value.
    profiles: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    /// namespace -> name -> declaration.
    vars: BTreeMap<String, BTreeMap<String, VarDef>>,
    namespaces: BTreeSet<String>,
}

impl Ctx {
    /// Build the context from the `[ctx.*]` tables and declared variables.
    ///
    /// `plugin_namespaces` are the `[plugins]` entry names; each becomes a
    /// legal namespace with free-form string variables.
    pub fn new(
        profile: Option<&str>,
        tables: &BTreeMap<String, BTreeMap<String, toml::Table>>,
        project_vars: Vec<VarDef>,
        plugin_namespaces: BTreeSet<String>,
    ) -> Result<Self> {
        let profile = profile.unwrap_or(DEFAULT_PROFILE).to_string();
        if profile != DEFAULT_PROFILE && !tables.contains_key(&profile) {
            return Err(Error::UnknownProfile { name: profile }.into());
        }

        let profiles = tables
            .iter()
            .map(|(profile, namespaces)| {
                let namespaces = namespaces
                    .iter()
                    .map(|(namespace, table)| {
                        let values = table
                            .iter()
                            .map(|(key, value)| (key.clone(), render_toml(value)))
                            .collect();
                        (namespace.clone(), values)
                    })
                    .collect();
                (profile.clone(), namespaces)
            })
            .collect();

        let mut vars: BTreeMap<String, BTreeMap<String, VarDef>> = BTreeMap::new();
        vars.insert(
            PROJECT_NAMESPACE.to_string(),
            project_vars
                .into_iter()
                .map(|var| (var.name.clone(), var))
                .collect(),
        );

        let mut namespaces: BTreeSet<String> = plugin_namespaces;
        namespaces.insert(PROJECT_NAMESPACE.to_string());
        namespaces.insert(QIK_NAMESPACE.to_string());

        Ok(Self {
            profile,
            profiles,
            vars,
            namespaces,
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Resolve `namespace.name` to a typed value, or `None` when the
    /// variable is optional and nothing provides it.
    pub fn lookup(&self, namespace: &str, name: &str) -> Result<Option<CtxValue>> {
        if !self.namespaces.contains(namespace) {
            return Err(Error::CtxNamespace {
                namespace: namespace.to_string(),
            }
            .into());
        }

        let decl = self
            .vars
            .get(namespace)
            .and_then(|vars| vars.get(name));
        let ty = decl.map(|decl| decl.ty).unwrap_or_default();

        let env_key = format!(
            "{}__{}",
            namespace.to_uppercase(),
            name.to_uppercase()
        );
        if let Ok(raw) = std::env::var(&env_key) {
            trace!(%namespace, %name, %env_key, "context from environment");
            return cast(namespace, name, &raw, ty).map(Some);
        }

        let profile_value = self
            .profiles
            .get(&self.profile)
            .and_then(|namespaces| namespaces.get(namespace))
            .and_then(|values| values.get(name));
        if let Some(raw) = profile_value {
            trace!(%namespace, %name, profile = %self.profile, "context from profile");
            return cast(namespace, name, raw, ty).map(Some);
        }

        if let Some(decl) = decl {
            if let Some(default) = &decl.default {
                return cast(namespace, name, default, ty).map(Some);
            }
            if decl.required {
                return Err(Error::CtxMissing {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
                .into());
            }
        }

        Ok(None)
    }

    /// Resolve to the string form for template substitution. Absent optional
    /// variables render as the empty string.
    pub fn render(&self, namespace: &str, name: &str) -> Result<String> {
        Ok(self
            .lookup(namespace, name)?
            .map(|value| value.render())
            .unwrap_or_default())
    }
}

/// Accepted boolean strings, case-insensitive.
const TRUE_STRINGS: &[&str] = &["yes", "true", "1"];
const FALSE_STRINGS: &[&str] = &["no", "false", "0"];

fn cast(namespace: &str, name: &str, raw: &str, ty: VarType) -> Result<CtxValue> {
    let type_cast = || Error::CtxTypeCast {
        namespace: namespace.to_string(),
        name: name.to_string(),
        value: raw.to_string(),
        ty: ty.to_string(),
    };
    match ty {
        VarType::Str => Ok(CtxValue::Str(raw.to_string())),
        VarType::Int => raw
            .parse::<i64>()
            .map(CtxValue::Int)
            .map_err(|_| type_cast().into()),
        VarType::Bool => {
            let lower = raw.to_lowercase();
            if TRUE_STRINGS.contains(&lower.as_str()) {
                Ok(CtxValue::Bool(true))
            } else if FALSE_STRINGS.contains(&lower.as_str()) {
                Ok(CtxValue::Bool(false))
            } else {
                Err(type_cast().into())
            }
        }
    }
}

fn render_toml(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
