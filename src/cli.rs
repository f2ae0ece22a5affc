// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `taskdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskdag",
    version,
    about = "Run YAML-defined tasks with dependencies, fingerprinting and parallel execution.",
    long_about = None
)]
pub struct CliArgs {
    /// Tasks to run, optionally mixed with NAME=VALUE variable overrides.
    ///
    /// With no task given, the task named `default` is run.
    #[arg(value_name = "TASK|NAME=VALUE")]
    pub targets: Vec<String>,

    /// Arguments forwarded to the tasks as the CLI_ARGS variable.
    #[arg(last = true, value_name = "ARGS")]
    pub cli_args: Vec<String>,

    /// Directory in which to look for the taskfile.
    #[arg(short = 'd', long, value_name = "DIR")]
    pub dir: Option<String>,

    /// Explicit taskfile path or URL instead of auto-discovery.
    #[arg(short = 't', long = "taskfile", value_name = "PATH")]
    pub entrypoint: Option<String>,

    /// Suppress command banners.
    #[arg(short = 's', long)]
    pub silent: bool,

    /// Emit up-to-date notices and other diagnostics.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Compile and print what would run without launching any commands.
    #[arg(long)]
    pub dry: bool,

    /// Run the requested task even if it is up to date.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Run every task in the graph even if up to date.
    #[arg(long)]
    pub force_all: bool,

    /// Maximum number of tasks in their command phase at once (0 = unlimited).
    #[arg(short = 'C', long, value_name = "N", default_value_t = 0)]
    pub concurrency: usize,

    /// Allow remote includes over plain HTTP.
    #[arg(long)]
    pub insecure: bool,

    /// Re-download remote includes even when cached.
    #[arg(long)]
    pub download: bool,

    /// Never touch the network; fail on uncached remote includes.
    #[arg(long)]
    pub offline: bool,

    /// Assume "yes" for all prompts.
    #[arg(short = 'y', long = "yes")]
    pub assume_yes: bool,

    /// Print a task-summary block before execution.
    #[arg(long)]
    pub summary: bool,

    /// Default output style (interleaved, group, prefixed, none).
    #[arg(short = 'o', long, value_name = "STYLE")]
    pub output: Option<String>,

    /// Global deadline, e.g. "30s" or "5m".
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Disable the schema version check on load.
    #[arg(long)]
    pub no_version_check: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
