//! The static plugin registry.
//!
//! Plugins register named variants: cache backends, virtualenv managers, and
//! commands injected into the configuration. There is no runtime code
//! loading; everything registerable is compiled in and looked up by its
//! `type` tag (cache variants) or dotted module path (`[plugins]` entries)
//! at configuration time.

use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::Result;

use crate::{
    cache::{CacheBackend, DirStore, LocalCache, RemoteCache, RepoCache},
    config::{CacheConf, CommandDef, Module, Space},
    dep::Dep,
    error::Error,
    repo::Repo,
    venv::UvPlugin,
};

/// A compiled-in plugin, addressable from `[plugins]` by its dotted path.
pub trait Plugin: Send + Sync {
    /// The dotted module path users write in `[plugins]`.
    fn path(&self) -> &'static str;

    /// Commands this plugin contributes to the configuration. `name` is the
    /// key the user bound the plugin to.
    fn commands(&self, name: &str, spaces: &BTreeMap<String, Space>) -> Vec<CommandDef>;
}

/// Factory for a cache variant.
pub type CacheFactory =
    fn(name: &str, conf: &CacheConf, repo: &Repo) -> Result<Arc<dyn CacheBackend>>;

/// Factory for a dependency variant: the table form of the dependency plus
/// the (space, module) scope of the runnable being expanded.
pub type DepFactory =
    fn(conf: &toml::Table, space: Option<&Space>, module: Option<&Module>) -> Result<Dep>;

/// The registry of cache, dep, and venv variants plus plugins.
pub struct Registry {
    cache_types: BTreeMap<&'static str, CacheFactory>,
    dep_types: BTreeMap<&'static str, DepFactory>,
    venv_types: BTreeMap<&'static str, ()>,
    plugins: BTreeMap<&'static str, Arc<dyn Plugin>>,
}

impl Registry {
    /// The registry with every built-in variant registered.
    pub fn builtin() -> Self {
        let mut registry = Self {
            cache_types: BTreeMap::new(),
            dep_types: BTreeMap::new(),
            venv_types: BTreeMap::new(),
            plugins: BTreeMap::new(),
        };
        registry.register_cache_type("local", local_cache_factory);
        registry.register_cache_type("repo", repo_cache_factory);
        registry.register_cache_type("dir", dir_cache_factory);
        registry.register_venv_type("uv");
        registry.register_plugin(Arc::new(UvPlugin));
        registry
    }

    /// Register a cache variant under its `type` tag.
    pub fn register_cache_type(&mut self, ty: &'static str, factory: CacheFactory) {
        self.cache_types.insert(ty, factory);
    }

    /// Register a dependency variant under its `type` tag. The built-in
    /// variants (glob, const, pydist, command, lock) never consult this;
    /// only unrecognized tags are routed here.
    pub fn register_dep_type(&mut self, ty: &'static str, factory: DepFactory) {
        self.dep_types.insert(ty, factory);
    }

    /// Register a virtualenv variant tag.
    pub fn register_venv_type(&mut self, ty: &'static str) {
        self.venv_types.insert(ty, ());
    }

    /// Register a plugin under its dotted path.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.path(), plugin);
    }

    /// Look up a plugin by dotted path.
    pub fn plugin(&self, path: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(path)
    }

    /// Whether a venv `type` tag is registered.
    pub fn has_venv_type(&self, ty: &str) -> bool {
        self.venv_types.contains_key(ty)
    }

    /// Build a plugin-provided dependency from its table form.
    pub fn custom_dep(
        &self,
        conf: &toml::Table,
        space: Option<&Space>,
        module: Option<&Module>,
    ) -> Result<Dep> {
        let ty = conf
            .get("type")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        let factory = self.dep_types.get(ty).ok_or_else(|| Error::PluginImport {
            path: ty.to_string(),
            message: String::from("no dep variant registered under this type"),
        })?;
        factory(conf, space, module)
    }

    /// Instantiate the backend for a `[caches.NAME]` section.
    pub fn cache_backend(
        &self,
        name: &str,
        conf: &CacheConf,
        repo: &Repo,
    ) -> Result<Arc<dyn CacheBackend>> {
        let factory = self.cache_types.get(conf.ty.as_str()).ok_or_else(|| {
            Error::PluginImport {
                path: conf.ty.clone(),
                message: String::from("no cache variant registered under this type"),
            }
        })?;
        factory(name, conf, repo)
    }
}

fn conf_path(conf: &CacheConf, key: &str) -> Option<String> {
    conf.rest
        .get(key)
        .and_then(|value| value.as_str())
        .map(String::from)
}

fn local_cache_factory(
    name: &str,
    conf: &CacheConf,
    repo: &Repo,
) -> Result<Arc<dyn CacheBackend>> {
    let root = conf_path(conf, "path")
        .map(|path| repo.root().join(path))
        .unwrap_or_else(|| repo.local_cache_dir());
    Ok(Arc::new(
        LocalCache::new(name, root).with_worktree(repo.root()),
    ))
}

fn repo_cache_factory(
    name: &str,
    _conf: &CacheConf,
    repo: &Repo,
) -> Result<Arc<dyn CacheBackend>> {
    Ok(Arc::new(RepoCache::new(name, repo.clone())))
}

/// A remote cache whose object store is a shared directory. The `path` key
/// is required and usually points outside the repository.
fn dir_cache_factory(
    name: &str,
    conf: &CacheConf,
    repo: &Repo,
) -> Result<Arc<dyn CacheBackend>> {
    let path = conf_path(conf, "path").ok_or_else(|| Error::PluginImport {
        path: String::from("dir"),
        message: String::from("the dir cache type requires a path"),
    })?;
    let local = LocalCache::new(name, repo.local_cache_dir()).with_worktree(repo.root());
    Ok(Arc::new(RemoteCache::new(
        name,
        local,
        Arc::new(DirStore::new(path)),
    )))
}
