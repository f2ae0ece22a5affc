// src/compile/compiler.rs

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use regex::Regex;
use tracing::debug;

use crate::compile::forloop::{iterations, LoopIteration};
use crate::compile::platform::matches_current;
use crate::errors::{Result, TaskError};
use crate::exec::capture_script;
use crate::fingerprint::{checksum_of, expand_globs, fingerprint_key, timestamp_of};
use crate::taskfile::loader::resolve_relative;
use crate::taskfile::model::{CmdOp, Method, RequiredVar, RunPolicy, Var, Vars};
use crate::taskfile::{LoadedTaskfile, TaskDefinition};
use crate::vars::{expand, expand_opt, expand_vec, Scope, Value};

/// A runtime request to execute a task.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub task: String,
    /// Call-site variable bindings.
    pub vars: BTreeMap<String, Value>,
    /// Came from a dep or cmd rather than a top-level invocation.
    pub indirect: bool,
    /// Suppress banners for this invocation (silent deps).
    pub silent: bool,
    /// Namespace of the calling task, for relative name resolution.
    pub namespace: Option<String>,
}

impl Call {
    pub fn new(task: impl Into<String>) -> Self {
        Call {
            task: task.into(),
            ..Call::default()
        }
    }
}

/// A task with every template expanded against a concrete scope, the working
/// directory resolved, and source globs expanded to file lists.
#[derive(Debug, Clone)]
pub struct CompiledTask {
    /// Concrete called name (wildcard patterns resolved to the match).
    pub name: String,
    /// Display name used in banners and messages.
    pub label: String,
    pub namespace: Option<String>,
    pub dir: PathBuf,
    /// Environment passed to every command of this task.
    pub env: BTreeMap<String, String>,
    pub cmds: Vec<CompiledCmd>,
    pub deps: Vec<CompiledCall>,
    pub sources: Vec<String>,
    pub source_files: Vec<PathBuf>,
    pub generates: Vec<String>,
    pub status: Vec<String>,
    pub preconditions: Vec<CompiledPrecondition>,
    pub requires: Vec<RequiredVar>,
    pub run_policy: RunPolicy,
    pub method: Method,
    pub silent: bool,
    pub ignore_error: bool,
    pub internal: bool,
    pub prompt: Option<String>,
    pub desc: Option<String>,
    pub summary: Option<String>,
    pub set: Vec<String>,
    pub shopt: Vec<String>,
    /// Stable key for dedup and the fingerprint store.
    pub fingerprint_key: String,
    /// Rendered task-level variable bindings feeding the checksum.
    pub resolved_vars: BTreeMap<String, String>,
    /// Full flattened scope, for `requires` checks.
    pub all_vars: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CompiledCmd {
    pub op: CompiledOp,
    pub silent: bool,
    pub ignore_error: bool,
}

#[derive(Debug, Clone)]
pub enum CompiledOp {
    Shell(String),
    Call(CompiledCall),
    Defer(Box<CompiledOp>),
}

#[derive(Debug, Clone)]
pub struct CompiledCall {
    pub task: String,
    pub vars: BTreeMap<String, Value>,
    pub silent: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledPrecondition {
    pub sh: String,
    pub msg: String,
}

/// Per-compile cache of dynamic variable results, keyed by (command, dir).
type DynVarCache = HashMap<(String, PathBuf), String>;

/// Compiles [`Call`]s into [`CompiledTask`]s against one loaded taskfile
/// hierarchy.
pub struct Compiler<'a> {
    pub loaded: &'a LoadedTaskfile,
    /// dotenv + root env, already expanded; the environment dynamic vars and
    /// commands run under.
    pub base_env: &'a BTreeMap<String, String>,
    pub user_working_dir: &'a Path,
    /// Rendered CLI_ARGS value.
    pub cli_args: &'a str,
    /// Skip directory creation (dry mode).
    pub dry: bool,
}

impl<'a> Compiler<'a> {
    /// Produce a fully resolved task for one call.
    pub async fn compile(&self, call: &Call) -> Result<CompiledTask> {
        let (def, captures) = self.resolve(&call.task, call.namespace.as_deref())?;
        let concrete_name = if def.name.contains('*') {
            self.loaded.rewrite_prefix_alias(&call.task)
        } else {
            def.name.clone()
        };
        debug!(task = %concrete_name, "compiling task");

        let task = &def.task;
        let mut cache = DynVarCache::new();

        // First pass: a static-only scope good enough to resolve `dir`.
        // Dynamic vars must run in the task's resolved directory, so their
        // evaluation waits for the second pass.
        let mut static_scope = self.base_scope();
        self.push_static_layers(&mut static_scope, &def, call, &captures, &concrete_name);

        let dir = self.resolve_dir(task.dir.as_deref(), &def, &static_scope)?;

        // Second pass: the real scope, dynamic vars included. Taskfile-level
        // bindings are also collected in rendered form: they feed the
        // checksum, and must not pick up ambient process-env noise.
        let mut scope = self.base_scope();
        let mut resolved_vars: BTreeMap<String, String> = BTreeMap::new();
        self.push_special_base(&mut scope, &def, &captures, &concrete_name, &dir);
        if def.namespace.is_some() {
            self.push_vars(&mut scope, &def.file_vars, &dir, &mut cache, &mut resolved_vars)
                .await?;
            self.push_vars(&mut scope, &def.include_vars, &dir, &mut cache, &mut resolved_vars)
                .await?;
        } else {
            self.push_vars(&mut scope, &self.loaded.root.vars, &dir, &mut cache, &mut resolved_vars)
                .await?;
        }
        self.push_vars(&mut scope, &task.vars, &dir, &mut cache, &mut resolved_vars)
            .await?;
        scope.push_layer();
        for (name, value) in &call.vars {
            let value = expand_value(value.clone(), &scope);
            resolved_vars.insert(name.clone(), value.render());
            scope.set(name.clone(), value);
        }

        // Sources first; CHECKSUM/TIMESTAMP become available to everything
        // expanded afterwards (status scripts in particular).
        let sources = expand_vec(&task.sources, &scope);
        let source_files = expand_globs(&dir, &sources)?;
        scope.push_layer();
        if !task.sources.is_empty() {
            scope.set(
                "CHECKSUM",
                Value::Str(checksum_of(&source_files, &resolved_vars)?),
            );
            scope.set("TIMESTAMP", Value::Str(timestamp_of(&source_files)));
        }

        let env = self.task_env(task, &scope, &dir, &mut cache).await?;

        let cmds = self
            .compile_cmds(task, &mut scope, &source_files, &dir, &mut cache)
            .await?;
        let deps = self
            .compile_deps(task, &mut scope, &source_files, &dir, &mut cache)
            .await?;

        let generates = expand_vec(&task.generates, &scope);
        let status = expand_vec(&task.status, &scope);
        let preconditions = task
            .preconditions
            .iter()
            .map(|p| {
                let sh = expand(&p.sh, &scope);
                let msg = expand_opt(p.msg.as_deref(), &scope)
                    .unwrap_or_else(|| format!("`{sh}` failed"));
                CompiledPrecondition { sh, msg }
            })
            .collect();

        let label = expand_opt(task.label.as_deref(), &scope)
            .unwrap_or_else(|| concrete_name.clone());

        let bound: BTreeMap<String, String> = call
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect();
        let key = fingerprint_key(&concrete_name, &bound);

        let root = &self.loaded.root;
        Ok(CompiledTask {
            label,
            namespace: def.namespace.clone(),
            env,
            cmds,
            deps,
            sources,
            source_files,
            generates,
            status,
            preconditions,
            requires: task
                .requires
                .as_ref()
                .map(|r| r.vars.clone())
                .unwrap_or_default(),
            run_policy: task.run.or(root.run).unwrap_or_default(),
            method: task.method.or(root.method).unwrap_or_default(),
            silent: task.silent || root.silent,
            ignore_error: task.ignore_error,
            internal: def.internal,
            prompt: expand_opt(task.prompt.as_deref(), &scope),
            desc: expand_opt(task.desc.as_deref(), &scope),
            summary: expand_opt(task.summary.as_deref(), &scope),
            set: if task.set.is_empty() { root.set.clone() } else { task.set.clone() },
            shopt: if task.shopt.is_empty() { root.shopt.clone() } else { task.shopt.clone() },
            fingerprint_key: key,
            resolved_vars,
            all_vars: scope.flatten(),
            dir,
            name: concrete_name,
        })
    }

    /// Resolve a call target: exact name, alias, then wildcard patterns.
    /// Wildcard captures come back as `MATCH_0..n` values.
    fn resolve(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(Arc<TaskDefinition>, Vec<String>)> {
        let rewritten = self.loaded.rewrite_prefix_alias(name);

        if let Some(canonical) = resolve_relative(self.loaded, &rewritten, namespace) {
            let def = self.loaded.tasks[canonical].clone();
            return Ok((def, Vec::new()));
        }

        let mut matched: Vec<(Arc<TaskDefinition>, Vec<String>)> = Vec::new();
        for (task_name, def) in &self.loaded.tasks {
            if !task_name.contains('*') {
                continue;
            }
            let re = wildcard_regex(task_name)?;
            if let Some(caps) = re.captures(&rewritten) {
                let captures = caps
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str().to_string())
                    .collect();
                matched.push((def.clone(), captures));
            }
        }

        match matched.len() {
            0 => Err(TaskError::TaskNotFound {
                name: name.to_string(),
            }),
            1 => Ok(matched.remove(0)),
            _ => Err(TaskError::AmbiguousTask {
                name: name.to_string(),
                candidates: matched.iter().map(|(d, _)| d.name.clone()).collect(),
            }),
        }
    }

    /// Outermost layers: process environment, then dotenv entries.
    fn base_scope(&self) -> Scope {
        let mut scope = Scope::new();
        for (k, v) in std::env::vars() {
            scope.set(k, Value::Str(v));
        }
        scope.push_layer();
        for (k, v) in &self.loaded.dotenv {
            scope.set(k.clone(), Value::Str(v.clone()));
        }
        scope
    }

    /// Static-value-only layers for the `dir` resolution pass.
    fn push_static_layers(
        &self,
        scope: &mut Scope,
        def: &TaskDefinition,
        call: &Call,
        captures: &[String],
        concrete_name: &str,
    ) {
        let statics = |scope: &mut Scope, vars: &Vars| {
            scope.push_layer();
            for (name, var) in vars {
                if let Some(value) = &var.value {
                    let v = expand_value(Value::from_yaml(value.clone()), scope);
                    scope.set(name.clone(), v);
                }
            }
        };

        self.push_special_base(scope, def, captures, concrete_name, &def.taskfile_dir);
        if def.namespace.is_some() {
            statics(scope, &def.file_vars);
            statics(scope, &def.include_vars);
        } else {
            statics(scope, &self.loaded.root.vars);
        }
        statics(scope, &def.task.vars);
        scope.push_layer();
        for (name, value) in &call.vars {
            scope.set(name.clone(), value.clone());
        }
    }

    /// Special variables that do not depend on the resolved dir contents.
    fn push_special_base(
        &self,
        scope: &mut Scope,
        def: &TaskDefinition,
        captures: &[String],
        concrete_name: &str,
        task_dir: &Path,
    ) {
        scope.push_layer();
        scope.set("TASK", Value::Str(concrete_name.to_string()));
        scope.set(
            "ROOT_DIR",
            Value::Str(self.loaded.root_dir.display().to_string()),
        );
        scope.set("TASKFILE", Value::Str(self.loaded.entrypoint.clone()));
        scope.set(
            "TASKFILE_DIR",
            Value::Str(def.taskfile_dir.display().to_string()),
        );
        scope.set("TASK_DIR", Value::Str(task_dir.display().to_string()));
        scope.set(
            "USER_WORKING_DIR",
            Value::Str(self.user_working_dir.display().to_string()),
        );
        scope.set(
            "TASK_VERSION",
            Value::Str(self.loaded.root.version.clone().unwrap_or_default()),
        );
        scope.set("CLI_ARGS", Value::Str(self.cli_args.to_string()));
        scope.set(
            "TASK_EXE",
            Value::Str(
                std::env::current_exe()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "taskdag".to_string()),
            ),
        );
        for (i, capture) in captures.iter().enumerate() {
            scope.set(format!("MATCH_{i}"), Value::Str(capture.clone()));
        }
    }

    /// Resolve the task's working directory to an absolute path, creating it
    /// when explicitly declared and missing.
    fn resolve_dir(
        &self,
        declared: Option<&str>,
        def: &TaskDefinition,
        scope: &Scope,
    ) -> Result<PathBuf> {
        let dir = match declared {
            Some(raw) => {
                let expanded = expand(raw, scope);
                let path = Path::new(&expanded);
                let abs = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    def.taskfile_dir.join(path)
                };
                if !abs.exists() && !self.dry {
                    std::fs::create_dir_all(&abs)
                        .with_context(|| format!("creating task directory {abs:?}"))
                        .map_err(TaskError::Internal)?;
                }
                abs
            }
            None => def.taskfile_dir.clone(),
        };
        // Resolve symlinks where possible so fingerprints and cwd agree.
        Ok(dir.canonicalize().unwrap_or(dir))
    }

    /// Push one `vars:` block as a new scope layer, resolving dynamic values
    /// and recording the rendered bindings.
    async fn push_vars(
        &self,
        scope: &mut Scope,
        vars: &Vars,
        dir: &Path,
        cache: &mut DynVarCache,
        rendered: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        scope.push_layer();
        for (name, var) in vars {
            let value = self.resolve_var(var, scope, dir, cache).await?;
            rendered.insert(name.clone(), value.render());
            scope.set(name.clone(), value);
        }
        Ok(())
    }

    /// Resolve a single declaration to a concrete value. Dynamic results are
    /// cached per (command, dir) for the duration of this compile only.
    async fn resolve_var(
        &self,
        var: &Var,
        scope: &Scope,
        dir: &Path,
        cache: &mut DynVarCache,
    ) -> Result<Value> {
        if let Some(sh) = &var.sh {
            let script = expand(sh, scope);
            let key = (script.clone(), dir.to_path_buf());
            if let Some(cached) = cache.get(&key) {
                return Ok(Value::Str(cached.clone()));
            }
            let (out, code) = capture_script(&script, dir, self.base_env).await?;
            if code != 0 {
                return Err(TaskError::Internal(anyhow!(
                    "dynamic variable command {script:?} exited with status {code}"
                )));
            }
            let trimmed = out
                .strip_suffix('\n')
                .map(|s| s.strip_suffix('\r').unwrap_or(s))
                .unwrap_or(&out)
                .to_string();
            cache.insert(key, trimmed.clone());
            return Ok(Value::Str(trimmed));
        }

        let raw = var.value.clone().unwrap_or(serde_yaml::Value::Null);
        Ok(expand_value(Value::from_yaml(raw), scope))
    }

    /// Environment passed to this task's commands: the ambient base env plus
    /// the task's own `env:` block.
    async fn task_env(
        &self,
        task: &crate::taskfile::model::Task,
        scope: &Scope,
        dir: &Path,
        cache: &mut DynVarCache,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = self.base_env.clone();
        for (name, var) in &task.env {
            let value = self.resolve_var(var, scope, dir, cache).await?;
            env.insert(name.clone(), value.render());
        }
        Ok(env)
    }

    async fn compile_cmds(
        &self,
        task: &crate::taskfile::model::Task,
        scope: &mut Scope,
        source_files: &[PathBuf],
        dir: &Path,
        cache: &mut DynVarCache,
    ) -> Result<Vec<CompiledCmd>> {
        let mut out = Vec::new();
        // Task-level defers first: cleanup is registered before any cmd can
        // fail.
        for cmd in task.defer.iter().chain(task.cmds.iter()) {
            if !matches_current(&cmd.platforms) {
                continue;
            }
            for iter in self.loop_iterations(cmd.for_spec.as_ref(), scope, source_files, dir) {
                push_iteration(scope, &iter);
                let op = self.compile_op(&cmd.op, scope, dir, cache).await?;
                out.push(CompiledCmd {
                    op,
                    silent: cmd.silent,
                    ignore_error: cmd.ignore_error,
                });
                scope.pop_layer();
            }
        }
        Ok(out)
    }

    async fn compile_deps(
        &self,
        task: &crate::taskfile::model::Task,
        scope: &mut Scope,
        source_files: &[PathBuf],
        dir: &Path,
        cache: &mut DynVarCache,
    ) -> Result<Vec<CompiledCall>> {
        let mut out = Vec::new();
        for dep in &task.deps {
            for iter in self.loop_iterations(dep.for_spec.as_ref(), scope, source_files, dir) {
                push_iteration(scope, &iter);
                let mut vars = BTreeMap::new();
                for (name, var) in &dep.vars {
                    vars.insert(
                        name.clone(),
                        self.resolve_var(var, scope, dir, cache).await?,
                    );
                }
                out.push(CompiledCall {
                    task: expand(&dep.task, scope),
                    vars,
                    silent: dep.silent,
                });
                scope.pop_layer();
            }
        }
        Ok(out)
    }

    fn loop_iterations(
        &self,
        spec: Option<&crate::taskfile::model::ForSpec>,
        scope: &Scope,
        source_files: &[PathBuf],
        dir: &Path,
    ) -> Vec<LoopIteration> {
        match spec {
            Some(spec) => iterations(spec, scope, source_files, dir),
            None => vec![LoopIteration {
                bindings: Vec::new(),
            }],
        }
    }

    async fn compile_op(
        &self,
        op: &CmdOp,
        scope: &Scope,
        dir: &Path,
        cache: &mut DynVarCache,
    ) -> Result<CompiledOp> {
        match op {
            CmdOp::Defer(inner) => Ok(CompiledOp::Defer(Box::new(
                self.compile_simple_op(inner, scope, dir, cache).await?,
            ))),
            simple => self.compile_simple_op(simple, scope, dir, cache).await,
        }
    }

    async fn compile_simple_op(
        &self,
        op: &CmdOp,
        scope: &Scope,
        dir: &Path,
        cache: &mut DynVarCache,
    ) -> Result<CompiledOp> {
        match op {
            CmdOp::Shell(script) => Ok(CompiledOp::Shell(expand(script, scope))),
            CmdOp::Call { task, vars } => {
                let mut resolved = BTreeMap::new();
                for (name, var) in vars {
                    resolved.insert(
                        name.clone(),
                        self.resolve_var(var, scope, dir, cache).await?,
                    );
                }
                Ok(CompiledOp::Call(CompiledCall {
                    task: expand(task, scope),
                    vars: resolved,
                    silent: false,
                }))
            }
            CmdOp::Defer(_) => Err(TaskError::Internal(anyhow!(
                "defer cannot nest another defer"
            ))),
        }
    }
}

fn push_iteration(scope: &mut Scope, iter: &LoopIteration) {
    scope.push_layer();
    for (name, value) in &iter.bindings {
        scope.set(name.clone(), value.clone());
    }
}

/// Expand template expressions inside a value, recursing into lists and maps.
fn expand_value(value: Value, scope: &Scope) -> Value {
    match value {
        Value::Str(s) => Value::Str(expand(&s, scope)),
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| expand_value(item, scope))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, expand_value(v, scope)))
                .collect(),
        ),
        other => other,
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::from("^");
    for part in pattern.split('*') {
        if !source.ends_with('^') {
            source.push_str("(.*)");
        }
        source.push_str(&regex::escape(part));
    }
    source.push('$');
    Regex::new(&source)
        .with_context(|| format!("building wildcard pattern for {pattern:?}"))
        .map_err(TaskError::Internal)
}
