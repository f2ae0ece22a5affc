// src/taskfile/loader.rs

//! Recursive taskfile loading and merging.
//!
//! Loading maintains a stack of in-flight entrypoints for include-cycle
//! detection and merges every reachable task into one namespace, prefixing
//! included task names with the include alias (`alias:task`) unless the
//! include is flattened. Parent globals never leak into included files; the
//! include directive's `vars:` are the only conduit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, warn};

use crate::errors::{Result, TaskError};
use crate::taskfile::dotenv;
use crate::taskfile::model::{Task, Taskfile, Vars};
use crate::taskfile::remote::{RemoteCache, RemotePolicy};
use crate::vars::{expand, Scope, Value};

/// File names probed during auto-discovery, in priority order.
pub const SUPPORTED_FILE_NAMES: &[&str] = &[
    "Taskfile.yml",
    "Taskfile.yaml",
    "Taskfile.dist.yml",
    "Taskfile.dist.yaml",
];

const MIN_SCHEMA_VERSION: f64 = 3.0;

/// Where a taskfile lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Local(PathBuf),
    Remote(String),
}

impl Source {
    /// Stable key for cycle detection and display.
    pub fn key(&self) -> String {
        match self {
            Source::Local(path) => path.display().to_string(),
            Source::Remote(url) => url.clone(),
        }
    }
}

/// Options controlling a [`load`] run.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Directory auto-discovery starts from.
    pub dir: PathBuf,
    /// Explicit entrypoint (path or URL) instead of auto-discovery.
    pub entrypoint: Option<String>,
    /// Cache root for remote taskfile bodies.
    pub remote_cache_dir: PathBuf,
    pub policy: RemotePolicy,
    /// Enforce the schema version on every loaded file.
    pub version_check: bool,
}

/// One task in the merged namespace, together with the context it needs at
/// compile time.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Fully qualified name (`alias:name` for included tasks).
    pub name: String,
    pub task: Task,
    /// Namespace prefix this task was registered under, if any.
    pub namespace: Option<String>,
    /// Base directory for the task's relative `dir`.
    pub taskfile_dir: PathBuf,
    /// Display location of the owning taskfile.
    pub location: String,
    /// Variables passed down the include chain (the parent's conduit).
    pub include_vars: Vars,
    /// The owning file's own globals.
    pub file_vars: Vars,
    pub internal: bool,
}

/// The merged result of loading a taskfile hierarchy.
#[derive(Debug)]
pub struct LoadedTaskfile {
    /// The root tree (globals, env, defaults, output style).
    pub root: Taskfile,
    pub entrypoint: String,
    pub root_dir: PathBuf,
    pub tasks: BTreeMap<String, Arc<TaskDefinition>>,
    /// Alias (task aliases, include aliases, `alias` for `alias:default`) to
    /// canonical qualified name.
    pub aliases: BTreeMap<String, String>,
    /// Entries parsed from the root taskfile's dotenv files.
    pub dotenv: BTreeMap<String, String>,
}

impl LoadedTaskfile {
    /// Resolve an exact name or alias to its canonical task name.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        if self.tasks.contains_key(name) {
            return Some(self.tasks[name].name.as_str());
        }
        self.aliases.get(name).map(String::as_str)
    }

    /// Look a definition up by exact name or alias.
    pub fn get(&self, name: &str) -> Option<&Arc<TaskDefinition>> {
        self.canonical_name(name).and_then(|n| self.tasks.get(n))
    }
}

/// Load and merge the taskfile hierarchy rooted at the configured entrypoint.
pub async fn load(opts: &LoadOptions) -> Result<LoadedTaskfile> {
    let (source, root_dir) = resolve_entrypoint(opts)?;
    debug!(entrypoint = %source.key(), dir = ?root_dir, "loading taskfile hierarchy");

    let mut loader = Loader {
        opts,
        remote: RemoteCache::new(opts.remote_cache_dir.clone()),
        stack: Vec::new(),
        tasks: BTreeMap::new(),
        aliases: BTreeMap::new(),
    };

    let root = loader
        .load_file(
            source.clone(),
            IncludeContext {
                prefix: None,
                dir: root_dir.clone(),
                include_vars: Vars::new(),
                internal: false,
                excludes: Vec::new(),
                is_root: true,
            },
        )
        .await?;

    let dotenv = load_root_dotenv(&root, &root_dir)?;

    let loaded = LoadedTaskfile {
        root,
        entrypoint: source.key(),
        root_dir,
        tasks: loader.tasks,
        aliases: loader.aliases,
        dotenv,
    };

    validate_static_deps(&loaded)?;
    Ok(loaded)
}

/// Figure out the root entrypoint: explicit path/URL, or walk upward from
/// `dir` probing the supported file names.
fn resolve_entrypoint(opts: &LoadOptions) -> Result<(Source, PathBuf)> {
    if let Some(entry) = &opts.entrypoint {
        if is_remote(entry) {
            return Ok((Source::Remote(entry.clone()), opts.dir.clone()));
        }
        let path = absolute(&opts.dir, Path::new(entry));
        let path = if path.is_dir() {
            find_in_dir(&path).ok_or_else(|| TaskError::TaskfileNotFound {
                dir: path.clone(),
                searched: SUPPORTED_FILE_NAMES.join(", "),
            })?
        } else {
            path
        };
        if !path.is_file() {
            return Err(TaskError::TaskfileNotFound {
                dir: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
                searched: path.display().to_string(),
            });
        }
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        return Ok((Source::Local(path), dir));
    }

    let mut dir = opts.dir.clone();
    loop {
        if let Some(found) = find_in_dir(&dir) {
            let root = found.parent().unwrap_or(Path::new(".")).to_path_buf();
            return Ok((Source::Local(found), root));
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => {
                return Err(TaskError::TaskfileNotFound {
                    dir: opts.dir.clone(),
                    searched: SUPPORTED_FILE_NAMES.join(", "),
                })
            }
        }
    }
}

fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    SUPPORTED_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Context an include passes down to the file it pulls in.
#[derive(Debug, Clone)]
struct IncludeContext {
    /// Namespace prefix for registered task names (`a:b` for nested includes).
    prefix: Option<String>,
    /// Effective base directory for the included tasks.
    dir: PathBuf,
    /// Accumulated conduit vars from the include chain.
    include_vars: Vars,
    internal: bool,
    /// Task names dropped from this namespace.
    excludes: Vec<String>,
    is_root: bool,
}

struct Loader<'a> {
    opts: &'a LoadOptions,
    remote: RemoteCache,
    /// Entrypoints currently being loaded, for cycle detection.
    stack: Vec<String>,
    tasks: BTreeMap<String, Arc<TaskDefinition>>,
    aliases: BTreeMap<String, String>,
}

impl<'a> Loader<'a> {
    /// Load one taskfile, register its tasks, and recurse into its includes.
    fn load_file(
        &mut self,
        source: Source,
        ctx: IncludeContext,
    ) -> BoxFuture<'_, Result<Taskfile>> {
        async move {
            let key = source.key();
            if let Some(pos) = self.stack.iter().position(|k| k == &key) {
                let mut chain: Vec<String> = self.stack[pos..].to_vec();
                chain.push(key);
                return Err(TaskError::IncludeCycle { chain });
            }
            self.stack.push(key.clone());

            let result = self.load_file_inner(&source, &ctx).await;
            self.stack.pop();
            result
        }
        .boxed()
    }

    async fn load_file_inner(
        &mut self,
        source: &Source,
        ctx: &IncludeContext,
    ) -> Result<Taskfile> {
        let body = match source {
            Source::Local(path) => {
                std::fs::read_to_string(path).map_err(|e| TaskError::TaskfileRead {
                    path: path.display().to_string(),
                    source: e,
                })?
            }
            Source::Remote(url) => self.remote.fetch(url, &self.opts.policy).await?,
        };

        let file: Taskfile =
            serde_yaml::from_str(&body).map_err(|e| TaskError::TaskfileParse {
                path: source.key(),
                source: e,
            })?;

        if self.opts.version_check {
            check_version(&file, &source.key())?;
        }

        if !ctx.is_root && !file.dotenv.is_empty() {
            return Err(TaskError::DotenvInInclude { path: source.key() });
        }

        self.register_tasks(&file, source, ctx)?;

        // Recurse into includes. The scope for expanding include paths sees
        // the process environment and this file's static globals only.
        let include_scope = include_expansion_scope(&file, ctx);
        let file_dir = match source {
            Source::Local(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| ctx.dir.clone()),
            Source::Remote(_) => ctx.dir.clone(),
        };

        for (name, include) in &file.includes {
            let taskfile_ref = expand(&include.taskfile, &include_scope);
            let child_source = self.resolve_include_source(source, &file_dir, &taskfile_ref)?;

            if include.optional && !source_exists(&child_source) {
                debug!(include = %name, taskfile = %taskfile_ref, "optional include missing; skipping");
                continue;
            }

            let child_dir = match &include.dir {
                Some(dir) => absolute(&file_dir, Path::new(&expand(dir, &include_scope))),
                None => match &child_source {
                    Source::Local(path) => path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| file_dir.clone()),
                    Source::Remote(_) => file_dir.clone(),
                },
            };

            // Conduit vars: outer chain first, this include's bindings win.
            let mut child_vars = ctx.include_vars.clone();
            for (k, v) in &include.vars {
                child_vars.insert(k.clone(), v.clone());
            }

            let child_prefix = if include.flatten {
                ctx.prefix.clone()
            } else {
                Some(match &ctx.prefix {
                    Some(parent) => format!("{parent}:{name}"),
                    None => name.clone(),
                })
            };

            if !include.flatten {
                self.register_include_aliases(name, &include.aliases, ctx)?;
            }

            let child_ctx = IncludeContext {
                prefix: child_prefix,
                dir: child_dir,
                include_vars: child_vars,
                internal: ctx.internal || include.internal,
                excludes: include.excludes.clone(),
                is_root: false,
            };

            self.load_file(child_source, child_ctx).await?;
        }

        Ok(file)
    }

    /// Register every task of `file` into the merged namespace.
    fn register_tasks(
        &mut self,
        file: &Taskfile,
        source: &Source,
        ctx: &IncludeContext,
    ) -> Result<()> {
        for (task_name, task) in &file.tasks {
            if ctx.excludes.iter().any(|e| e == task_name) {
                debug!(task = %task_name, "excluded from include namespace");
                continue;
            }

            let qualified = match &ctx.prefix {
                Some(prefix) => format!("{prefix}:{task_name}"),
                None => task_name.clone(),
            };

            if self.tasks.contains_key(&qualified) {
                return Err(TaskError::FlattenCollision {
                    name: qualified,
                    include: source.key(),
                });
            }

            let def = TaskDefinition {
                name: qualified.clone(),
                task: task.clone(),
                namespace: ctx.prefix.clone(),
                taskfile_dir: ctx.dir.clone(),
                location: source.key(),
                include_vars: ctx.include_vars.clone(),
                file_vars: file.vars.clone(),
                internal: ctx.internal || task.internal,
            };

            // `alias run` reaches `alias:default`.
            if task_name == "default" {
                if let Some(prefix) = &ctx.prefix {
                    self.aliases
                        .entry(prefix.clone())
                        .or_insert_with(|| qualified.clone());
                }
            }

            for alias in &task.aliases {
                let qualified_alias = match &ctx.prefix {
                    Some(prefix) => format!("{prefix}:{alias}"),
                    None => alias.clone(),
                };
                self.insert_alias(qualified_alias, qualified.clone())?;
            }

            self.tasks.insert(qualified, Arc::new(def));
        }
        Ok(())
    }

    fn register_include_aliases(
        &mut self,
        name: &str,
        aliases: &[String],
        ctx: &IncludeContext,
    ) -> Result<()> {
        for alias in aliases {
            let canonical_prefix = match &ctx.prefix {
                Some(parent) => format!("{parent}:{name}"),
                None => name.to_string(),
            };
            let alias_prefix = match &ctx.prefix {
                Some(parent) => format!("{parent}:{alias}"),
                None => alias.clone(),
            };
            // Prefix aliases are resolved at lookup time by rewriting the
            // leading segment, stored here as `aliasprefix:` -> `prefix:`.
            self.insert_alias(format!("{alias_prefix}:"), format!("{canonical_prefix}:"))?;
        }
        Ok(())
    }

    fn insert_alias(&mut self, alias: String, target: String) -> Result<()> {
        if let Some(existing) = self.aliases.get(&alias) {
            if existing != &target {
                return Err(TaskError::AmbiguousTask {
                    name: alias,
                    candidates: vec![existing.clone(), target],
                });
            }
        }
        if self.tasks.contains_key(&alias) {
            return Err(TaskError::AmbiguousTask {
                name: alias.clone(),
                candidates: vec![alias, target],
            });
        }
        self.aliases.insert(alias, target);
        Ok(())
    }

    fn resolve_include_source(
        &self,
        parent: &Source,
        parent_dir: &Path,
        reference: &str,
    ) -> Result<Source> {
        if is_remote(reference) {
            return Ok(Source::Remote(reference.to_string()));
        }
        match parent {
            Source::Local(_) => {
                let path = absolute(parent_dir, Path::new(reference));
                let path = if path.is_dir() {
                    find_in_dir(&path).unwrap_or_else(|| path.join(SUPPORTED_FILE_NAMES[0]))
                } else {
                    path
                };
                Ok(Source::Local(path))
            }
            // Relative includes from a remote file resolve against its URL.
            Source::Remote(url) => {
                let base = url.rsplit_once('/').map(|(b, _)| b).unwrap_or(url);
                Ok(Source::Remote(format!("{base}/{reference}")))
            }
        }
    }
}

fn source_exists(source: &Source) -> bool {
    match source {
        Source::Local(path) => path.is_file(),
        // Existence of remote optional includes is only known after a fetch;
        // treat them as present and let the fetch report the miss.
        Source::Remote(_) => true,
    }
}

/// Scope used when expanding include paths: process env plus the file's
/// static globals and the conduit vars it received.
fn include_expansion_scope(file: &Taskfile, ctx: &IncludeContext) -> Scope {
    let mut scope = Scope::new();
    for (k, v) in std::env::vars() {
        scope.set(k, Value::Str(v));
    }
    scope.push_layer();
    for (k, v) in &file.vars {
        if let Some(value) = &v.value {
            scope.set(k.clone(), Value::from_yaml(value.clone()));
        }
    }
    scope.push_layer();
    for (k, v) in &ctx.include_vars {
        if let Some(value) = &v.value {
            scope.set(k.clone(), Value::from_yaml(value.clone()));
        }
    }
    scope
}

fn check_version(file: &Taskfile, path: &str) -> Result<()> {
    let version = file.version.clone().unwrap_or_else(|| "(none)".to_string());
    let numeric: f64 = version.parse().unwrap_or(0.0);
    if numeric < MIN_SCHEMA_VERSION {
        return Err(TaskError::UnsupportedVersion {
            path: path.to_string(),
            version,
        });
    }
    Ok(())
}

/// Parse the root taskfile's dotenv files. Entries from earlier files win,
/// matching the usual dotenv layering.
fn load_root_dotenv(root: &Taskfile, root_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for entry in &root.dotenv {
        let path = absolute(root_dir, Path::new(entry));
        match dotenv::load_file(&path)? {
            Some(map) => {
                for (k, v) in map {
                    merged.entry(k).or_insert(v);
                }
            }
            None => debug!(path = ?path, "dotenv file missing; skipping"),
        }
    }
    Ok(merged)
}

/// Validate statically-named dependency edges with a toposort; templated dep
/// names are resolved at compile time and skipped here.
fn validate_static_deps(loaded: &LoadedTaskfile) -> Result<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in loaded.tasks.keys() {
        graph.add_node(name.as_str());
    }

    for (name, def) in &loaded.tasks {
        for dep in &def.task.deps {
            if dep.task.contains("${") {
                continue;
            }
            let resolved = resolve_relative(loaded, &dep.task, def.namespace.as_deref());
            match resolved {
                Some(dep_name) => {
                    graph.add_edge(dep_name, name.as_str(), ());
                }
                None => {
                    // Wildcard tasks may still cover this at compile time.
                    warn!(task = %name, dep = %dep.task, "dependency not found statically");
                }
            }
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        let node = cycle.node_id().to_string();
        return Err(TaskError::Internal(anyhow!(
            "dependency cycle detected involving task \"{node}\""
        )));
    }
    Ok(())
}

/// Resolve a task reference relative to a namespace: `ns:name` first, then
/// the bare name.
pub fn resolve_relative<'t>(
    loaded: &'t LoadedTaskfile,
    name: &str,
    namespace: Option<&str>,
) -> Option<&'t str> {
    if let Some(ns) = namespace {
        let scoped = format!("{ns}:{name}");
        if let Some(found) = loaded.canonical_name(&scoped) {
            return Some(found);
        }
    }
    loaded.canonical_name(name)
}

impl LoadedTaskfile {
    /// Apply prefix aliases (`alias:` -> `prefix:`) before exact lookup.
    pub fn rewrite_prefix_alias(&self, name: &str) -> String {
        if let Some((head, rest)) = name.split_once(':') {
            let key = format!("{head}:");
            if let Some(target) = self.aliases.get(&key) {
                return format!("{target}{rest}");
            }
        }
        name.to_string()
    }
}
