// src/taskfile/model.rs

//! YAML-backed data model for taskfiles.
//!
//! Most constructs accept both a short scalar form and a full mapping form
//! (`cmds: [echo hi]` vs `cmds: [{cmd: echo hi, silent: true}]`), handled by
//! custom `Deserialize` impls so the rest of the crate only ever sees the
//! structured representation. Cmds are a tagged union; a shell string, a
//! nested task call and a deferred cleanup cmd are distinct variants, never
//! strings with in-band markers.

use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

/// Ordered mapping of variable name to declaration.
pub type Vars = BTreeMap<String, Var>;

/// Top-level taskfile as parsed from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Taskfile {
    /// Schema version; must parse as a number >= 3.
    #[serde(default, deserialize_with = "de_version")]
    pub version: Option<String>,

    /// Included taskfiles, keyed by namespace alias.
    #[serde(default)]
    pub includes: BTreeMap<String, Include>,

    /// Default output style for all tasks in this run.
    #[serde(default)]
    pub output: Option<OutputStyle>,

    /// File-level variables.
    #[serde(default)]
    pub vars: Vars,

    /// File-level environment variables (exported to commands).
    #[serde(default)]
    pub env: Vars,

    /// Dotenv files, resolved relative to this file's directory.
    /// Only permitted in the root taskfile.
    #[serde(default)]
    pub dotenv: Vec<String>,

    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,

    /// Default run policy for tasks that do not declare one.
    #[serde(default)]
    pub run: Option<RunPolicy>,

    /// Default fingerprint method for tasks that do not declare one.
    #[serde(default)]
    pub method: Option<Method>,

    /// Suppress command banners for every task in this file.
    #[serde(default)]
    pub silent: bool,

    /// `set -o` options prefixed into every shell invocation.
    #[serde(default)]
    pub set: Vec<String>,

    /// `shopt -s` options prefixed into every shell invocation.
    #[serde(default)]
    pub shopt: Vec<String>,
}

/// An `includes:` entry. Short form is just the taskfile path.
#[derive(Debug, Clone, Default)]
pub struct Include {
    pub taskfile: String,
    /// Working-directory override for the included tasks.
    pub dir: Option<String>,
    /// Skip silently when the file does not exist.
    pub optional: bool,
    /// Merge into the parent namespace without a prefix.
    pub flatten: bool,
    /// Mark every included task internal.
    pub internal: bool,
    /// Extra namespace prefixes for the included tasks.
    pub aliases: Vec<String>,
    /// Task names dropped from the included namespace.
    pub excludes: Vec<String>,
    /// Variables passed into the included file; the only conduit by which
    /// the parent can influence it.
    pub vars: Vars,
}

impl<'de> Deserialize<'de> for Include {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            taskfile: String,
            #[serde(default)]
            dir: Option<String>,
            #[serde(default)]
            optional: bool,
            #[serde(default)]
            flatten: bool,
            #[serde(default)]
            internal: bool,
            #[serde(default)]
            aliases: Vec<String>,
            #[serde(default)]
            excludes: Vec<String>,
            #[serde(default)]
            vars: Vars,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(taskfile) => Ok(Include {
                taskfile,
                ..Include::default()
            }),
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                Ok(Include {
                    taskfile: full.taskfile,
                    dir: full.dir,
                    optional: full.optional,
                    flatten: full.flatten,
                    internal: full.internal,
                    aliases: full.aliases,
                    excludes: full.excludes,
                    vars: full.vars,
                })
            }
        }
    }
}

/// A task definition.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub desc: Option<String>,
    pub summary: Option<String>,
    pub aliases: Vec<String>,
    pub cmds: Vec<Cmd>,
    /// Cleanup cmds always executed when the task finishes, equivalent to a
    /// trailing block of `defer:` cmds.
    pub defer: Vec<Cmd>,
    pub deps: Vec<Dep>,
    pub vars: Vars,
    pub env: Vars,
    /// Rejected at load time; kept in the model so the loader can report
    /// where the offending declaration lives.
    pub dotenv: Vec<String>,
    pub dir: Option<String>,
    pub sources: Vec<String>,
    pub generates: Vec<String>,
    /// Shell predicates; all exiting zero means up to date.
    pub status: Vec<String>,
    pub preconditions: Vec<Precondition>,
    pub requires: Option<Requires>,
    pub internal: bool,
    pub silent: bool,
    pub run: Option<RunPolicy>,
    pub method: Option<Method>,
    pub ignore_error: bool,
    /// Display name replacing the task name in banners and messages.
    pub label: Option<String>,
    /// Confirmation question asked before running.
    pub prompt: Option<String>,
    pub platforms: Vec<Platform>,
    pub set: Vec<String>,
    pub shopt: Vec<String>,
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            #[serde(default)]
            desc: Option<String>,
            #[serde(default)]
            summary: Option<String>,
            #[serde(default)]
            aliases: Vec<String>,
            #[serde(default)]
            cmds: Vec<Cmd>,
            #[serde(default, deserialize_with = "de_defer_list")]
            defer: Vec<Cmd>,
            #[serde(default)]
            deps: Vec<Dep>,
            #[serde(default)]
            vars: Vars,
            #[serde(default)]
            env: Vars,
            #[serde(default)]
            dotenv: Vec<String>,
            #[serde(default)]
            dir: Option<String>,
            #[serde(default)]
            sources: Vec<String>,
            #[serde(default)]
            generates: Vec<String>,
            #[serde(default)]
            status: Vec<String>,
            #[serde(default)]
            preconditions: Vec<Precondition>,
            #[serde(default)]
            requires: Option<Requires>,
            #[serde(default)]
            internal: bool,
            #[serde(default)]
            silent: bool,
            #[serde(default)]
            run: Option<RunPolicy>,
            #[serde(default)]
            method: Option<Method>,
            #[serde(default)]
            ignore_error: bool,
            #[serde(default)]
            label: Option<String>,
            #[serde(default)]
            prompt: Option<String>,
            #[serde(default)]
            platforms: Vec<Platform>,
            #[serde(default)]
            set: Vec<String>,
            #[serde(default)]
            shopt: Vec<String>,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            // Short task notation: `build: go build ./...`
            serde_yaml::Value::String(cmd) => Ok(Task {
                cmds: vec![Cmd::shell(cmd)],
                ..Task::default()
            }),
            // List-of-cmds notation: `build: [tidy, go build ./...]`
            seq @ serde_yaml::Value::Sequence(_) => {
                let cmds: Vec<Cmd> =
                    serde_yaml::from_value(seq).map_err(D::Error::custom)?;
                Ok(Task {
                    cmds,
                    ..Task::default()
                })
            }
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                Ok(Task {
                    desc: full.desc,
                    summary: full.summary,
                    aliases: full.aliases,
                    cmds: full.cmds,
                    defer: full.defer,
                    deps: full.deps,
                    vars: full.vars,
                    env: full.env,
                    dotenv: full.dotenv,
                    dir: full.dir,
                    sources: full.sources,
                    generates: full.generates,
                    status: full.status,
                    preconditions: full.preconditions,
                    requires: full.requires,
                    internal: full.internal,
                    silent: full.silent,
                    run: full.run,
                    method: full.method,
                    ignore_error: full.ignore_error,
                    label: full.label,
                    prompt: full.prompt,
                    platforms: full.platforms,
                    set: full.set,
                    shopt: full.shopt,
                })
            }
        }
    }
}

/// One element of a task body.
#[derive(Debug, Clone)]
pub struct Cmd {
    pub op: CmdOp,
    pub silent: bool,
    pub ignore_error: bool,
    pub platforms: Vec<Platform>,
    pub for_spec: Option<ForSpec>,
}

/// What a cmd actually does.
#[derive(Debug, Clone)]
pub enum CmdOp {
    /// A shell command string.
    Shell(String),
    /// A nested task call with its own variable bindings.
    Call { task: String, vars: Vars },
    /// Execution postponed until the owning task finishes.
    Defer(Box<CmdOp>),
}

impl Cmd {
    pub fn shell(cmd: String) -> Self {
        Cmd {
            op: CmdOp::Shell(cmd),
            silent: false,
            ignore_error: false,
            platforms: Vec::new(),
            for_spec: None,
        }
    }
}

impl<'de> Deserialize<'de> for Cmd {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            #[serde(default)]
            cmd: Option<String>,
            #[serde(default)]
            task: Option<String>,
            #[serde(default)]
            defer: Option<serde_yaml::Value>,
            #[serde(default)]
            vars: Vars,
            #[serde(default)]
            silent: bool,
            #[serde(default)]
            ignore_error: bool,
            #[serde(default)]
            platforms: Vec<Platform>,
            #[serde(rename = "for", default)]
            for_spec: Option<ForSpec>,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(cmd) => Ok(Cmd::shell(cmd)),
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                let op = match (full.cmd, full.task, full.defer) {
                    (Some(cmd), None, None) => CmdOp::Shell(cmd),
                    (None, Some(task), None) => CmdOp::Call {
                        task,
                        vars: full.vars.clone(),
                    },
                    (None, None, Some(deferred)) => {
                        CmdOp::Defer(Box::new(de_defer_op::<D>(deferred)?))
                    }
                    _ => {
                        return Err(D::Error::custom(
                            "cmd must have exactly one of `cmd`, `task` or `defer`",
                        ))
                    }
                };
                Ok(Cmd {
                    op,
                    silent: full.silent,
                    ignore_error: full.ignore_error,
                    platforms: full.platforms,
                    for_spec: full.for_spec,
                })
            }
        }
    }
}

/// The task-level `defer:` list: each entry is a shell string or a task
/// call, stored as an already-deferred [`Cmd`].
fn de_defer_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Cmd>, D::Error> {
    let entries = Vec::<serde_yaml::Value>::deserialize(de)?;
    entries
        .into_iter()
        .map(|entry| {
            let op = de_defer_op::<D>(entry)?;
            Ok(Cmd {
                op: CmdOp::Defer(Box::new(op)),
                silent: false,
                ignore_error: false,
                platforms: Vec::new(),
                for_spec: None,
            })
        })
        .collect()
}

/// Inner value of a `defer:` key: a shell string or a `{task: ..., vars: ...}`
/// call.
fn de_defer_op<'de, D: Deserializer<'de>>(
    value: serde_yaml::Value,
) -> Result<CmdOp, D::Error> {
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct DeferCall {
        task: String,
        #[serde(default)]
        vars: Vars,
    }

    match value {
        serde_yaml::Value::String(cmd) => Ok(CmdOp::Shell(cmd)),
        other => {
            let call: DeferCall =
                serde_yaml::from_value(other).map_err(D::Error::custom)?;
            Ok(CmdOp::Call {
                task: call.task,
                vars: call.vars,
            })
        }
    }
}

/// A dependency: a task call that must complete before the owner's cmds run.
#[derive(Debug, Clone)]
pub struct Dep {
    pub task: String,
    pub vars: Vars,
    pub silent: bool,
    pub for_spec: Option<ForSpec>,
}

impl<'de> Deserialize<'de> for Dep {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            task: String,
            #[serde(default)]
            vars: Vars,
            #[serde(default)]
            silent: bool,
            #[serde(rename = "for", default)]
            for_spec: Option<ForSpec>,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(task) => Ok(Dep {
                task,
                vars: Vars::new(),
                silent: false,
                for_spec: None,
            }),
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                Ok(Dep {
                    task: full.task,
                    vars: full.vars,
                    silent: full.silent,
                    for_spec: full.for_spec,
                })
            }
        }
    }
}

/// A variable declaration: either a static YAML value or a dynamic
/// shell-evaluated one (`{sh: git rev-parse HEAD}`).
#[derive(Debug, Clone, Default)]
pub struct Var {
    pub value: Option<serde_yaml::Value>,
    pub sh: Option<String>,
}

impl Var {
    pub fn literal(value: impl Into<String>) -> Self {
        Var {
            value: Some(serde_yaml::Value::String(value.into())),
            sh: None,
        }
    }
}

impl<'de> Deserialize<'de> for Var {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(de)?;
        if let serde_yaml::Value::Mapping(ref map) = value {
            if map.len() == 1 {
                if let Some(sh) = map.get(serde_yaml::Value::String("sh".into())) {
                    let sh = sh
                        .as_str()
                        .ok_or_else(|| D::Error::custom("`sh` must be a string"))?;
                    return Ok(Var {
                        value: None,
                        sh: Some(sh.to_string()),
                    });
                }
            }
        }
        Ok(Var {
            value: Some(value),
            sh: None,
        })
    }
}

/// A shell predicate guarding task execution.
#[derive(Debug, Clone)]
pub struct Precondition {
    pub sh: String,
    pub msg: Option<String>,
}

impl<'de> Deserialize<'de> for Precondition {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            sh: String,
            #[serde(default)]
            msg: Option<String>,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(sh) => Ok(Precondition { sh, msg: None }),
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                Ok(Precondition {
                    sh: full.sh,
                    msg: full.msg,
                })
            }
        }
    }
}

/// `requires:` block listing variables that must be bound and non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Requires {
    #[serde(default)]
    pub vars: Vec<RequiredVar>,
}

/// One required variable, optionally restricted to an allowed set.
#[derive(Debug, Clone)]
pub struct RequiredVar {
    pub name: String,
    pub allowed: Option<Vec<String>>,
}

impl<'de> Deserialize<'de> for RequiredVar {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            name: String,
            #[serde(rename = "enum", default)]
            allowed: Option<Vec<String>>,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(name) => Ok(RequiredVar {
                name,
                allowed: None,
            }),
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                Ok(RequiredVar {
                    name: full.name,
                    allowed: full.allowed,
                })
            }
        }
    }
}

/// `for:` loop specification on a cmd or dep.
#[derive(Debug, Clone)]
pub enum ForSpec {
    /// Explicit list of items.
    List(Vec<serde_yaml::Value>),
    /// Iterate over the task's resolved source files.
    Sources,
    /// Split a variable's value (whitespace by default).
    Var {
        var: String,
        split: Option<String>,
        alias: Option<String>,
    },
    /// Cross product over named dimensions; each dimension name is bound in
    /// the iteration scope.
    Matrix(BTreeMap<String, Vec<serde_yaml::Value>>),
}

impl<'de> Deserialize<'de> for ForSpec {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            #[serde(default)]
            var: Option<String>,
            #[serde(default)]
            split: Option<String>,
            #[serde(rename = "as", default)]
            alias: Option<String>,
            #[serde(default)]
            matrix: Option<BTreeMap<String, Vec<serde_yaml::Value>>>,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(s) if s == "sources" => Ok(ForSpec::Sources),
            serde_yaml::Value::String(other) => Err(D::Error::custom(format!(
                "invalid `for` keyword \"{other}\" (expected \"sources\", a list, or a mapping)"
            ))),
            serde_yaml::Value::Sequence(items) => Ok(ForSpec::List(items)),
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                match (full.var, full.matrix) {
                    (Some(var), None) => Ok(ForSpec::Var {
                        var,
                        split: full.split,
                        alias: full.alias,
                    }),
                    (None, Some(matrix)) => Ok(ForSpec::Matrix(matrix)),
                    _ => Err(D::Error::custom(
                        "`for` mapping must have exactly one of `var` or `matrix`",
                    )),
                }
            }
        }
    }
}

/// Platform predicate, e.g. `linux`, `arm64` or `linux/amd64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: Option<String>,
    pub arch: Option<String>,
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Platform::parse(&s).map_err(D::Error::custom)
    }
}

const KNOWN_OSES: &[&str] = &["linux", "darwin", "windows", "freebsd", "openbsd", "netbsd"];
const KNOWN_ARCHES: &[&str] = &["amd64", "arm64", "386", "arm", "riscv64"];

impl Platform {
    pub fn parse(s: &str) -> Result<Platform, String> {
        let s = s.trim().to_lowercase();
        if let Some((os, arch)) = s.split_once('/') {
            if !KNOWN_OSES.contains(&os) {
                return Err(format!("unknown OS \"{os}\""));
            }
            if !KNOWN_ARCHES.contains(&arch) {
                return Err(format!("unknown architecture \"{arch}\""));
            }
            return Ok(Platform {
                os: Some(os.to_string()),
                arch: Some(arch.to_string()),
            });
        }
        if KNOWN_OSES.contains(&s.as_str()) {
            return Ok(Platform {
                os: Some(s),
                arch: None,
            });
        }
        if KNOWN_ARCHES.contains(&s.as_str()) {
            return Ok(Platform {
                os: None,
                arch: Some(s),
            });
        }
        Err(format!("unknown platform \"{s}\""))
    }
}

/// Run policy: how often a task executes per Executor lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    #[default]
    Always,
    Once,
    WhenChanged,
}

/// Fingerprint method used by the up-to-date check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    #[default]
    Checksum,
    Timestamp,
    None,
}

/// Output style for command stdio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputStyle {
    #[default]
    Interleaved,
    Group {
        begin: Option<String>,
        end: Option<String>,
        error_only: bool,
    },
    Prefixed,
    Discard,
}

impl OutputStyle {
    /// Parse the plain-string form used by the CLI `--output` flag.
    pub fn parse(s: &str) -> Result<OutputStyle, String> {
        match s.trim().to_lowercase().as_str() {
            "interleaved" => Ok(OutputStyle::Interleaved),
            "group" => Ok(OutputStyle::Group {
                begin: None,
                end: None,
                error_only: false,
            }),
            "prefixed" => Ok(OutputStyle::Prefixed),
            "none" => Ok(OutputStyle::Discard),
            other => Err(format!(
                "invalid output style \"{other}\" (expected interleaved, group, prefixed or none)"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for OutputStyle {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct GroupOpts {
            #[serde(default)]
            begin: Option<String>,
            #[serde(default)]
            end: Option<String>,
            #[serde(default)]
            error_only: bool,
        }
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Full {
            group: GroupOpts,
        }

        let value = serde_yaml::Value::deserialize(de)?;
        match value {
            serde_yaml::Value::String(s) => {
                OutputStyle::parse(&s).map_err(D::Error::custom)
            }
            other => {
                let full: Full =
                    serde_yaml::from_value(other).map_err(D::Error::custom)?;
                Ok(OutputStyle::Group {
                    begin: full.group.begin,
                    end: full.group.end,
                    error_only: full.group.error_only,
                })
            }
        }
    }
}

/// Accept `version: 3`, `version: "3"` and `version: "3.38"`.
fn de_version<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_yaml::Value>::deserialize(de)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(D::Error::custom("version must be a string or number")),
    }
}
