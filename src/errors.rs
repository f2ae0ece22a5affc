// src/errors.rs

//! Crate-wide error types.
//!
//! Loader, compiler and runner failures that have user-facing semantics get a
//! variant here; IO plumbing stays on `anyhow` with context at the call site
//! and is wrapped into [`TaskError::Internal`] at module boundaries.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = TaskError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no taskfile found (searched for {searched} upwards from {dir:?})")]
    TaskfileNotFound { dir: PathBuf, searched: String },

    #[error("failed to read taskfile at {path}")]
    TaskfileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse taskfile at {path}: {source}")]
    TaskfileParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unsupported schema version \"{version}\" in {path}: version 3 or above is required")]
    UnsupportedVersion { path: String, version: String },

    #[error("include cycle detected: {}", .chain.join(" -> "))]
    IncludeCycle { chain: Vec<String> },

    #[error("duplicate task \"{name}\" while flattening include \"{include}\"")]
    FlattenCollision { name: String, include: String },

    #[error("dotenv is only allowed in the root taskfile (declared in {path})")]
    DotenvInInclude { path: String },

    #[error("failed to parse dotenv file {path}: {reason}")]
    DotenvParse { path: String, reason: String },

    #[error("task \"{name}\" does not exist")]
    TaskNotFound { name: String },

    #[error("task \"{name}\" is internal and cannot be invoked directly")]
    InternalTask { name: String },

    #[error("multiple tasks match \"{name}\": {}", .candidates.join(", "))]
    AmbiguousTask { name: String, candidates: Vec<String> },

    #[error("task \"{task}\" is missing required variables: {}", format_missing(.missing))]
    MissingRequiredVars { task: String, missing: Vec<MissingVar> },

    #[error("precondition failed: {message}")]
    PreconditionFailed { task: String, message: String },

    #[error("command \"{cmd}\" in task \"{task}\" exited with status {code}")]
    CommandFailed { task: String, cmd: String, code: i32 },

    #[error("task \"{name}\" was called too many times ({limit}): possible cyclic dependency")]
    CalledTooManyTimes { name: String, limit: u32 },

    #[error("refusing to fetch {url} over insecure transport (pass --insecure to allow)")]
    InsecureRemote { url: String },

    #[error("taskfile {url} is not cached and network access is disabled (offline mode)")]
    OfflineCacheMiss { url: String },

    #[error("failed to download taskfile {url}: {reason}")]
    RemoteFetch { url: String, reason: String },

    #[error("task cancelled")]
    PromptDenied,

    #[error("task execution cancelled")]
    Cancelled,

    #[error("task execution timed out")]
    Timeout,

    #[error(transparent)]
    Upstream(#[from] Arc<TaskError>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A `requires` entry that was not satisfied.
#[derive(Debug, Clone)]
pub struct MissingVar {
    pub name: String,
    /// Allowed values when the variable was declared with an enum.
    pub allowed: Option<Vec<String>>,
}

fn format_missing(missing: &[MissingVar]) -> String {
    missing
        .iter()
        .map(|m| match &m.allowed {
            Some(allowed) => format!("{} (allowed: {})", m.name, allowed.join(", ")),
            None => m.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl TaskError {
    /// Exit code for the process when this error reaches `main`.
    ///
    /// The shell's status is surfaced verbatim when the root target's own
    /// command failed; everything else is a generic failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskError::CommandFailed { code, .. } => *code,
            TaskError::Upstream(inner) => inner.exit_code(),
            _ => 1,
        }
    }

    /// True when the failure came from cancellation rather than a command.
    pub fn is_cancellation(&self) -> bool {
        match self {
            TaskError::Cancelled | TaskError::Timeout | TaskError::PromptDenied => true,
            TaskError::Upstream(inner) => inner.is_cancellation(),
            _ => false,
        }
    }
}
