// src/lib.rs

pub mod cli;
pub mod compile;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fingerprint;
pub mod logging;
pub mod taskfile;
pub mod vars;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::debug;

use crate::cli::CliArgs;
use crate::compile::Call;
use crate::engine::{Executor, ExecutorOptions};
use crate::errors::{Result, TaskError};
use crate::taskfile::model::OutputStyle;
use crate::vars::Value;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - executor options from CLI flags
/// - taskfile loading (Executor setup)
/// - Ctrl-C handling
/// - one run per requested target
pub async fn run(args: CliArgs) -> Result<()> {
    let output = args
        .output
        .as_deref()
        .map(OutputStyle::parse)
        .transpose()
        .map_err(|e| TaskError::Internal(anyhow!(e)))?;

    let timeout = args
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| TaskError::Internal(anyhow!(e)))?;

    // Targets may be mixed with NAME=VALUE global variable overrides.
    let mut overrides: BTreeMap<String, Value> = BTreeMap::new();
    let mut targets: Vec<String> = Vec::new();
    for arg in &args.targets {
        match split_override(arg) {
            Some((name, value)) => {
                overrides.insert(name.to_string(), Value::Str(value.to_string()));
            }
            None => targets.push(arg.clone()),
        }
    }
    if targets.is_empty() {
        targets.push("default".to_string());
    }

    let opts = ExecutorOptions {
        dir: args.dir.as_deref().map(PathBuf::from),
        entrypoint: args.entrypoint.clone(),
        silent: args.silent,
        verbose: args.verbose,
        dry: args.dry,
        force: args.force,
        force_all: args.force_all,
        concurrency: args.concurrency,
        insecure: args.insecure,
        download: args.download,
        offline: args.offline,
        assume_yes: args.assume_yes,
        summary: args.summary,
        output,
        timeout,
        version_check: !args.no_version_check,
        cli_args: args.cli_args.clone(),
        ..ExecutorOptions::default()
    };

    let executor = Arc::new(Executor::setup(opts).await?);

    // Ctrl-C -> root cancellation. Deferred cleanup still runs.
    {
        let token = executor.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
    }

    for target in targets {
        debug!(target = %target, "running top-level target");
        let call = Call {
            task: target,
            vars: overrides.clone(),
            indirect: false,
            silent: false,
            namespace: None,
        };
        executor.run(call).await?;
    }

    Ok(())
}

/// Split a `NAME=VALUE` command-line override. Only uppercase-ish variable
/// names qualify, so `scripts/build=prod.sh`-style targets stay targets.
fn split_override(arg: &str) -> Option<(&str, &str)> {
    let (name, value) = arg.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some((name, value))
    } else {
        None
    }
}

/// Parse durations like `300ms`, `30s`, `5m` or `1h`; bare numbers are
/// seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("invalid duration unit {other:?} in {s:?}")),
    };
    if secs < 0.0 {
        return Err(format!("duration {s:?} must not be negative"));
    }
    Ok(Duration::from_secs_f64(secs))
}
