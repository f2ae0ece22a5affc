// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually running the shell commands defined
//! in tasks, using `tokio::process::Command`, and for routing their stdio
//! through the output renderer.
//!
//! - [`command`] launches the external interpreter with the task's env, cwd
//!   and cancellation wiring.
//! - [`output`] implements the interleaved / group / prefixed / none output
//!   strategies.

pub mod command;
pub mod output;

pub use command::{capture_script, run_script, script_succeeds, ShellJob};
pub use output::{stderr_writer, stdout_writer, writer_from, CmdSink, Renderer, SharedWriter, StreamKind};
