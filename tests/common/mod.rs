// tests/common/mod.rs

//! Shared helpers for integration tests: build a taskfile in a tempdir, run
//! an executor against it, and capture everything it writes.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use taskdag::compile::Call;
use taskdag::engine::{Executor, ExecutorOptions, TempDirs};
use taskdag::errors::Result;
use taskdag::exec::writer_from;
use taskdag::vars::Value;

/// Thread-safe capture buffer standing in for stdout/stderr.
#[derive(Clone, Default)]
pub struct Capture {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap()).into_owned()
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn write_taskfile(dir: &Path, content: &str) {
    std::fs::write(dir.join("Taskfile.yml"), content).unwrap();
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn read_file(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

/// Build an executor rooted at `dir`, capturing both output streams into one
/// buffer. `tweak` adjusts options before setup.
pub async fn executor_in<F>(dir: &Path, tweak: F) -> (Arc<Executor>, Capture)
where
    F: FnOnce(&mut ExecutorOptions),
{
    let capture = Capture::default();
    let mut opts = ExecutorOptions {
        dir: Some(dir.to_path_buf()),
        temp_dir: Some(TempDirs {
            remote: dir.join(".taskdag/remote"),
            fingerprint: dir.join(".taskdag"),
        }),
        stdout: Some(writer_from(Box::new(CaptureWriter(capture.inner.clone())))),
        stderr: Some(writer_from(Box::new(CaptureWriter(capture.inner.clone())))),
        ..ExecutorOptions::default()
    };
    tweak(&mut opts);

    let executor = Executor::setup(opts).await.expect("executor setup");
    (Arc::new(executor), capture)
}

pub async fn run_target(executor: &Arc<Executor>, name: &str) -> Result<()> {
    executor.run(Call::new(name)).await
}

pub async fn run_target_with_vars(
    executor: &Arc<Executor>,
    name: &str,
    vars: &[(&str, &str)],
) -> Result<()> {
    let vars: BTreeMap<String, Value> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect();
    executor
        .run(Call {
            task: name.to_string(),
            vars,
            ..Call::default()
        })
        .await
}
