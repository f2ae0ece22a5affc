// src/engine/executor.rs

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compile::{Call, CompiledCall, CompiledOp, CompiledTask, Compiler};
use crate::engine::dedup::DedupMap;
use crate::errors::{MissingVar, Result, TaskError};
use crate::exec::{
    capture_script, run_script, script_succeeds, stderr_writer, stdout_writer, Renderer,
    ShellJob, SharedWriter,
};
use crate::fingerprint::{self, Fingerprint, FingerprintStore};
use crate::taskfile::loader::{load, LoadOptions, LoadedTaskfile};
use crate::taskfile::model::{OutputStyle, RunPolicy};
use crate::taskfile::RemotePolicy;
use crate::vars::{expand, Scope, Value};

/// Runtime call-count cap per task name, catching cyclic deps the static
/// loader check cannot see.
const MAX_CALLS_PER_TASK: u32 = 100;

/// Cache roots for remote taskfile bodies and fingerprints.
#[derive(Debug, Clone)]
pub struct TempDirs {
    pub remote: PathBuf,
    pub fingerprint: PathBuf,
}

/// Options accepted by [`Executor::setup`].
pub struct ExecutorOptions {
    /// Directory the loader starts auto-discovery from. Defaults to the
    /// current working directory.
    pub dir: Option<PathBuf>,
    /// Explicit taskfile path or URL.
    pub entrypoint: Option<String>,
    /// Cache roots; default `<dir>/.taskdag`.
    pub temp_dir: Option<TempDirs>,
    pub stdout: Option<SharedWriter>,
    pub stderr: Option<SharedWriter>,
    pub silent: bool,
    pub verbose: bool,
    pub dry: bool,
    /// Skip the up-to-date check for the root target only.
    pub force: bool,
    /// Skip the up-to-date check for every task in the run.
    pub force_all: bool,
    /// Max concurrent tasks in their cmds phase; 0 means unlimited.
    pub concurrency: usize,
    pub insecure: bool,
    pub download: bool,
    pub offline: bool,
    pub assume_yes: bool,
    /// Print a task summary block before execution.
    pub summary: bool,
    /// Output style override; falls back to the root taskfile, then
    /// interleaved.
    pub output: Option<OutputStyle>,
    pub timeout: Option<Duration>,
    pub version_check: bool,
    pub user_working_dir: Option<PathBuf>,
    /// Raw arguments surfaced to tasks as `CLI_ARGS`.
    pub cli_args: Vec<String>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            dir: None,
            entrypoint: None,
            temp_dir: None,
            stdout: None,
            stderr: None,
            silent: false,
            verbose: false,
            dry: false,
            force: false,
            force_all: false,
            concurrency: 0,
            insecure: false,
            download: false,
            offline: false,
            assume_yes: false,
            summary: false,
            output: None,
            timeout: None,
            version_check: true,
            user_working_dir: None,
            cli_args: Vec::new(),
        }
    }
}

/// The task execution engine.
///
/// Holds the merged taskfile namespace plus all state shared across task
/// runs: the dedup registry, the fingerprint store, the concurrency
/// semaphore and the root cancellation token.
///
/// A single task run walks
/// `compile -> preconditions -> dedup -> requires -> up-to-date -> deps ->
/// cmds -> deferred -> fingerprint`, terminal in every error branch and
/// always draining the defer stack.
pub struct Executor {
    opts: ExecutorOptions,
    loaded: LoadedTaskfile,
    renderer: Renderer,
    store: FingerprintStore,
    dedup: DedupMap,
    semaphore: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    timed_out: AtomicBool,
    call_counts: Mutex<HashMap<String, u32>>,
    /// dotenv + root-level env, expanded once at setup.
    base_env: BTreeMap<String, String>,
    user_working_dir: PathBuf,
    cli_args: String,
}

/// A deferred cmd waiting on the owner's defer stack.
struct DeferredRun {
    op: CompiledOp,
    silent: bool,
}

impl Executor {
    /// Load the taskfile hierarchy and prepare all shared state.
    pub async fn setup(opts: ExecutorOptions) -> Result<Executor> {
        let dir = match &opts.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .map_err(|e| TaskError::Internal(anyhow!("resolving current dir: {e}")))?,
        };
        let temp = opts.temp_dir.clone().unwrap_or_else(|| TempDirs {
            remote: dir.join(".taskdag").join("remote"),
            fingerprint: dir.join(".taskdag"),
        });

        let loaded = load(&LoadOptions {
            dir: dir.clone(),
            entrypoint: opts.entrypoint.clone(),
            remote_cache_dir: temp.remote.clone(),
            policy: RemotePolicy {
                insecure: opts.insecure,
                offline: opts.offline,
                download: opts.download,
                assume_yes: opts.assume_yes,
            },
            version_check: opts.version_check,
        })
        .await?;

        let base_env = resolve_base_env(&loaded).await?;

        let style = opts
            .output
            .clone()
            .or_else(|| loaded.root.output.clone())
            .unwrap_or_default();
        let renderer = Renderer::new(
            opts.stdout.clone().unwrap_or_else(stdout_writer),
            opts.stderr.clone().unwrap_or_else(stderr_writer),
            style,
            opts.silent,
            opts.verbose,
        );

        let semaphore = match opts.concurrency {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let user_working_dir = opts
            .user_working_dir
            .clone()
            .unwrap_or_else(|| dir.clone());
        let cli_args = opts.cli_args.join(" ");

        Ok(Executor {
            store: FingerprintStore::new(temp.fingerprint),
            dedup: DedupMap::new(),
            semaphore,
            cancel: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            call_counts: Mutex::new(HashMap::new()),
            base_env,
            user_working_dir,
            cli_args,
            renderer,
            loaded,
            opts,
        })
    }

    /// Root cancellation token; cancel it to stop the whole run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The merged namespace, for callers that want to inspect it.
    pub fn taskfile(&self) -> &LoadedTaskfile {
        &self.loaded
    }

    /// Execute one top-level call to completion.
    pub async fn run(self: &Arc<Self>, call: Call) -> Result<()> {
        if let Some(timeout) = self.opts.timeout {
            let me = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                me.timed_out.store(true, Ordering::SeqCst);
                me.cancel.cancel();
            });
        }

        if self.opts.summary {
            let compiled = self.compiler().compile(&call).await?;
            self.print_summary(&compiled);
        }

        let result = self.clone().run_call(call, self.cancel.clone()).await;
        match result {
            Err(err) if err.is_cancellation() && self.timed_out.load(Ordering::SeqCst) => {
                Err(TaskError::Timeout)
            }
            other => other,
        }
    }

    fn compiler(&self) -> Compiler<'_> {
        Compiler {
            loaded: &self.loaded,
            base_env: &self.base_env,
            user_working_dir: &self.user_working_dir,
            cli_args: &self.cli_args,
            dry: self.opts.dry,
        }
    }

    /// Run a single call: compile, guard, and execute (or await the dedup
    /// cell of an equivalent run).
    fn run_call(
        self: Arc<Self>,
        call: Call,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            if token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            self.bump_call_count(&call.task)?;

            let compiled = self.compiler().compile(&call).await?;
            debug!(task = %compiled.name, key = %compiled.fingerprint_key, "compiled call");

            if compiled.internal && !call.indirect {
                return Err(TaskError::InternalTask {
                    name: compiled.name,
                });
            }

            self.check_preconditions(&compiled).await?;

            if compiled.run_policy == RunPolicy::Always {
                return self.clone().execute(call, compiled, token).await;
            }

            // `once` / `when_changed`: all callers of this key share one
            // execution and observe the same completion.
            let cell = self.dedup.cell(&compiled.fingerprint_key);
            let me = self.clone();
            let result = cell
                .get_or_init(|| async move {
                    me.clone()
                        .execute(call, compiled, token)
                        .await
                        .map_err(Arc::new)
                })
                .await
                .clone();
            result.map_err(TaskError::Upstream)
        }
        .boxed()
    }

    fn bump_call_count(&self, task: &str) -> Result<()> {
        let mut counts = self.call_counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(task.to_string()).or_insert(0);
        *count += 1;
        if *count > MAX_CALLS_PER_TASK {
            return Err(TaskError::CalledTooManyTimes {
                name: task.to_string(),
                limit: MAX_CALLS_PER_TASK,
            });
        }
        Ok(())
    }

    async fn execute(
        self: Arc<Self>,
        call: Call,
        task: CompiledTask,
        token: CancellationToken,
    ) -> Result<()> {
        self.check_requires(&task)?;

        let force = self.opts.force_all || (self.opts.force && !call.indirect);
        if !force && self.is_up_to_date(&task).await? {
            let task_silent = task.silent || call.silent;
            if !task_silent || self.renderer.verbose() {
                self.renderer
                    .message(&format!("Task \"{}\" is up to date", task.label));
            }
            return Ok(());
        }

        if let Some(prompt) = &task.prompt {
            if !self.approve(prompt).await? {
                return Err(TaskError::PromptDenied);
            }
        }

        self.run_deps(&task, &token).await?;

        let mut deferred = Vec::new();
        let result = self.run_cmds(&call, &task, &token, &mut deferred).await;

        // The defer stack always drains, in reverse declaration order, on a
        // detached token: cleanup survives cancellation of the owning task.
        self.run_deferred(&task, deferred).await;

        if result.is_ok() && !self.opts.dry {
            let fp = self.fingerprint_of(&task);
            fingerprint::persist(&fp, &self.store)?;
        }

        result
    }

    fn check_requires(&self, task: &CompiledTask) -> Result<()> {
        let mut missing = Vec::new();
        for required in &task.requires {
            let value = task.all_vars.get(&required.name);
            let satisfied = match (value, &required.allowed) {
                (None, _) => false,
                (Some(v), None) => !v.is_empty(),
                (Some(v), Some(allowed)) => allowed.contains(&v.render()),
            };
            if !satisfied {
                missing.push(MissingVar {
                    name: required.name.clone(),
                    allowed: required.allowed.clone(),
                });
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TaskError::MissingRequiredVars {
                task: task.name.clone(),
                missing,
            })
        }
    }

    async fn check_preconditions(&self, task: &CompiledTask) -> Result<()> {
        for precondition in &task.preconditions {
            if !script_succeeds(&precondition.sh, &task.dir, &task.env).await? {
                self.renderer.message(&precondition.msg);
                return Err(TaskError::PreconditionFailed {
                    task: task.name.clone(),
                    message: precondition.msg.clone(),
                });
            }
        }
        Ok(())
    }

    fn fingerprint_of<'t>(&self, task: &'t CompiledTask) -> Fingerprint<'t> {
        Fingerprint {
            key: &task.fingerprint_key,
            method: task.method,
            dir: &task.dir,
            env: &task.env,
            sources: &task.source_files,
            has_sources: !task.sources.is_empty(),
            generates: &task.generates,
            status: &task.status,
            resolved_vars: &task.resolved_vars,
        }
    }

    async fn is_up_to_date(&self, task: &CompiledTask) -> Result<bool> {
        if task.status.is_empty() && task.sources.is_empty() {
            return Ok(false);
        }
        fingerprint::is_up_to_date(&self.fingerprint_of(task), &self.store).await
    }

    /// Run all deps concurrently; the first failure cancels the remaining
    /// siblings and becomes the primary error once everything settled.
    async fn run_deps(
        self: &Arc<Self>,
        task: &CompiledTask,
        token: &CancellationToken,
    ) -> Result<()> {
        if task.deps.is_empty() {
            return Ok(());
        }

        let sibling_token = token.child_token();
        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for dep in &task.deps {
            let call = self.call_for(dep, task);
            let me = self.clone();
            let dep_token = sibling_token.clone();
            set.spawn(async move { me.run_call(call, dep_token).await });
        }

        let mut first_error: Option<TaskError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| TaskError::Internal(anyhow!("dependency task panicked: {e}")))?;
            if let Err(err) = result {
                if first_error.is_none() {
                    sibling_token.cancel();
                    first_error = Some(err);
                } else if !err.is_cancellation() {
                    warn!(error = %err, task = %task.name, "additional dependency failure");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn call_for(&self, target: &CompiledCall, owner: &CompiledTask) -> Call {
        Call {
            task: target.task.clone(),
            vars: target.vars.clone(),
            indirect: true,
            silent: target.silent,
            namespace: owner.namespace.clone(),
        }
    }

    /// Run the task's cmds in declared order, collecting deferred entries.
    /// Holds a concurrency slot for the duration of the cmds phase, released
    /// around nested task calls so a busy parent cannot starve its children.
    async fn run_cmds(
        self: &Arc<Self>,
        call: &Call,
        task: &CompiledTask,
        token: &CancellationToken,
        deferred: &mut Vec<DeferredRun>,
    ) -> Result<()> {
        let mut slot = self.acquire_slot().await?;

        for cmd in &task.cmds {
            if token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            match &cmd.op {
                CompiledOp::Defer(inner) => {
                    deferred.push(DeferredRun {
                        op: (**inner).clone(),
                        silent: cmd.silent,
                    });
                }
                CompiledOp::Call(nested) => {
                    let child_call = Call {
                        silent: nested.silent || cmd.silent || call.silent,
                        ..self.call_for(nested, task)
                    };
                    drop(slot.take());
                    let result = self.clone().run_call(child_call, token.clone()).await;
                    slot = self.acquire_slot().await?;
                    if let Err(err) = result {
                        if cmd.ignore_error || task.ignore_error {
                            self.renderer.verbose_message(&format!(
                                "command error ignored: {err}"
                            ));
                            continue;
                        }
                        return Err(err);
                    }
                }
                CompiledOp::Shell(script) => {
                    self.renderer
                        .banner(&task.label, script, cmd.silent || task.silent || call.silent);
                    if self.opts.dry {
                        continue;
                    }

                    let mut sink = self.renderer.sink(&task.label);
                    let job = ShellJob {
                        script,
                        dir: &task.dir,
                        env: &task.env,
                        set: &task.set,
                        shopt: &task.shopt,
                    };
                    match run_script(job, &mut sink, token).await {
                        Ok(0) => sink.finish(true),
                        Ok(code) => {
                            sink.finish(false);
                            if cmd.ignore_error || task.ignore_error {
                                self.renderer.verbose_message(&format!(
                                    "command exited with status {code} (ignored)"
                                ));
                                continue;
                            }
                            return Err(TaskError::CommandFailed {
                                task: task.name.clone(),
                                cmd: script.clone(),
                                code,
                            });
                        }
                        Err(err) => {
                            sink.finish(false);
                            return Err(err);
                        }
                    }
                }
            }
        }

        drop(slot);
        Ok(())
    }

    /// Drain the defer stack in LIFO order. Failures are reported but never
    /// replace the primary error; cancellation of the owner does not reach
    /// deferred cmds.
    async fn run_deferred(self: &Arc<Self>, task: &CompiledTask, deferred: Vec<DeferredRun>) {
        if deferred.is_empty() {
            return;
        }
        let detached = CancellationToken::new();

        for entry in deferred.into_iter().rev() {
            match entry.op {
                CompiledOp::Shell(script) => {
                    self.renderer
                        .banner(&task.label, &script, entry.silent || task.silent);
                    if self.opts.dry {
                        continue;
                    }
                    let mut sink = self.renderer.sink(&task.label);
                    let job = ShellJob {
                        script: &script,
                        dir: &task.dir,
                        env: &task.env,
                        set: &task.set,
                        shopt: &task.shopt,
                    };
                    match run_script(job, &mut sink, &detached).await {
                        Ok(0) => sink.finish(true),
                        Ok(code) => {
                            sink.finish(false);
                            warn!(task = %task.name, cmd = %script, code, "deferred command failed");
                        }
                        Err(err) => {
                            sink.finish(false);
                            warn!(task = %task.name, cmd = %script, error = %err, "deferred command errored");
                        }
                    }
                }
                CompiledOp::Call(nested) => {
                    let child_call = Call {
                        silent: nested.silent || entry.silent,
                        ..self.call_for(&nested, task)
                    };
                    if let Err(err) = self.clone().run_call(child_call, detached.clone()).await {
                        warn!(task = %task.name, error = %err, "deferred task failed");
                    }
                }
                CompiledOp::Defer(_) => {
                    // The model layer rejects nested defers.
                    debug!(task = %task.name, "ignoring nested defer");
                }
            }
        }
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.semaphore {
            None => Ok(None),
            Some(semaphore) => semaphore
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| TaskError::Cancelled),
        }
    }

    async fn approve(&self, prompt: &str) -> Result<bool> {
        if self.opts.assume_yes {
            return Ok(true);
        }
        self.renderer.message(&format!("{prompt} [y/N]"));
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| TaskError::Internal(anyhow!("prompt task failed: {e}")))?
        .map_err(|e| TaskError::Internal(anyhow!("reading prompt answer: {e}")))?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    fn print_summary(&self, task: &CompiledTask) {
        self.renderer.plain(&format!("task: {}", task.label));
        if let Some(desc) = task.summary.as_deref().or(task.desc.as_deref()) {
            self.renderer.plain("");
            self.renderer.plain(desc);
        }
        if !task.deps.is_empty() {
            self.renderer.plain("");
            self.renderer.plain("dependencies:");
            for dep in &task.deps {
                self.renderer.plain(&format!(" - {}", dep.task));
            }
        }
        if !task.cmds.is_empty() {
            self.renderer.plain("");
            self.renderer.plain("commands:");
            for cmd in &task.cmds {
                match &cmd.op {
                    CompiledOp::Shell(script) => {
                        self.renderer.plain(&format!(" - {script}"))
                    }
                    CompiledOp::Call(call) => {
                        self.renderer.plain(&format!(" - task: {}", call.task))
                    }
                    CompiledOp::Defer(_) => {}
                }
            }
        }
    }
}

/// Expand the root taskfile's `env:` block on top of the dotenv entries.
/// This is the ambient environment every command inherits.
async fn resolve_base_env(loaded: &LoadedTaskfile) -> Result<BTreeMap<String, String>> {
    let mut env: BTreeMap<String, String> = loaded.dotenv.clone();

    let mut scope = Scope::new();
    for (k, v) in std::env::vars() {
        scope.set(k, Value::Str(v));
    }
    scope.push_layer();
    for (k, v) in &loaded.dotenv {
        scope.set(k.clone(), Value::Str(v.clone()));
    }
    scope.push_layer();
    for (name, var) in &loaded.root.vars {
        if let Some(value) = &var.value {
            scope.set(name.clone(), Value::from_yaml(value.clone()));
        }
    }

    for (name, var) in &loaded.root.env {
        let rendered = match (&var.value, &var.sh) {
            (_, Some(sh)) => {
                let script = expand(sh, &scope);
                let (out, code) = capture_script(&script, &loaded.root_dir, &env).await?;
                if code != 0 {
                    return Err(TaskError::Internal(anyhow!(
                        "env command {script:?} exited with status {code}"
                    )));
                }
                out.strip_suffix('\n').unwrap_or(&out).to_string()
            }
            (Some(value), None) => {
                let v = Value::from_yaml(value.clone());
                match v {
                    Value::Str(s) => expand(&s, &scope),
                    other => other.render(),
                }
            }
            (None, None) => String::new(),
        };
        env.insert(name.clone(), rendered);
    }

    Ok(env)
}
