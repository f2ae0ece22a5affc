// src/exec/output.rs

//! Output rendering strategies for command stdio.
//!
//! The renderer is the only component that writes to the user-facing streams:
//! command output, banners and diagnostic messages all route through it so
//! grouping semantics stay consistent (a grouped task's banner must not
//! interleave with another task's output, dry-run banners must still group,
//! and so on).

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::taskfile::model::OutputStyle;

/// Shared handle to an output stream. Executor options inject buffers here in
/// tests; production wiring uses the process stdout/stderr.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn writer_from(w: Box<dyn Write + Send>) -> SharedWriter {
    Arc::new(Mutex::new(w))
}

pub fn stdout_writer() -> SharedWriter {
    writer_from(Box::new(std::io::stdout()))
}

pub fn stderr_writer() -> SharedWriter {
    writer_from(Box::new(std::io::stderr()))
}

fn write_line(target: &SharedWriter, line: &str) {
    // A poisoned lock still holds a usable writer.
    let mut guard = target.lock().unwrap_or_else(|e| e.into_inner());
    let _ = writeln!(guard, "{line}");
}

/// Which stream a command line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Facade over the executor's stdout/stderr applying one [`OutputStyle`].
#[derive(Clone)]
pub struct Renderer {
    stdout: SharedWriter,
    stderr: SharedWriter,
    style: OutputStyle,
    silent: bool,
    verbose: bool,
}

impl Renderer {
    pub fn new(
        stdout: SharedWriter,
        stderr: SharedWriter,
        style: OutputStyle,
        silent: bool,
        verbose: bool,
    ) -> Self {
        Self {
            stdout,
            stderr,
            style,
            silent,
            verbose,
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Command banner: `taskdag: [label] cmd`.
    pub fn banner(&self, label: &str, text: &str, cmd_silent: bool) {
        if self.silent || cmd_silent {
            return;
        }
        write_line(&self.stderr, &format!("taskdag: [{label}] {text}"));
    }

    /// General user-facing message.
    pub fn message(&self, text: &str) {
        write_line(&self.stderr, &format!("taskdag: {text}"));
    }

    /// Message emitted only in verbose mode.
    pub fn verbose_message(&self, text: &str) {
        if self.verbose {
            self.message(text);
        }
    }

    /// Raw line to stdout (summary output).
    pub fn plain(&self, text: &str) {
        write_line(&self.stdout, text);
    }

    /// Create the per-cmd sink implementing the configured style.
    pub fn sink(&self, label: &str) -> CmdSink {
        let mode = match &self.style {
            OutputStyle::Interleaved => SinkMode::PassThrough,
            OutputStyle::Group {
                begin,
                end,
                error_only,
            } => SinkMode::Group {
                buffered: Vec::new(),
                begin: begin.clone(),
                end: end.clone(),
                error_only: *error_only,
            },
            OutputStyle::Prefixed => SinkMode::Prefixed {
                label: label.to_string(),
            },
            OutputStyle::Discard => SinkMode::Discard,
        };
        CmdSink {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            mode,
        }
    }
}

enum SinkMode {
    PassThrough,
    Group {
        buffered: Vec<(StreamKind, String)>,
        begin: Option<String>,
        end: Option<String>,
        error_only: bool,
    },
    Prefixed {
        label: String,
    },
    Discard,
}

/// Receives one command's output lines and forwards, buffers or drops them
/// according to the style. `finish` must be called when the command exits so
/// grouped output gets flushed.
pub struct CmdSink {
    stdout: SharedWriter,
    stderr: SharedWriter,
    mode: SinkMode,
}

impl CmdSink {
    pub fn line(&mut self, kind: StreamKind, line: &str) {
        match &mut self.mode {
            SinkMode::PassThrough => {
                let target = match kind {
                    StreamKind::Stdout => &self.stdout,
                    StreamKind::Stderr => &self.stderr,
                };
                write_line(target, line);
            }
            SinkMode::Group { buffered, .. } => {
                buffered.push((kind, line.to_string()));
            }
            SinkMode::Prefixed { label } => {
                let target = match kind {
                    StreamKind::Stdout => &self.stdout,
                    StreamKind::Stderr => &self.stderr,
                };
                write_line(target, &format!("[{label}] {line}"));
            }
            SinkMode::Discard => {}
        }
    }

    /// Flush any buffered output. `success` feeds the group `error_only`
    /// suppression.
    pub fn finish(self, success: bool) {
        if let SinkMode::Group {
            buffered,
            begin,
            end,
            error_only,
        } = self.mode
        {
            if buffered.is_empty() || (error_only && success) {
                return;
            }
            if let Some(begin) = begin {
                write_line(&self.stdout, &begin);
            }
            for (kind, line) in buffered {
                let target = match kind {
                    StreamKind::Stdout => &self.stdout,
                    StreamKind::Stderr => &self.stderr,
                };
                write_line(target, &line);
            }
            if let Some(end) = end {
                write_line(&self.stdout, &end);
            }
        }
    }
}
