// src/fingerprint/checker.rs

//! Up-to-date decisions for compiled tasks.
//!
//! Three methods: `checksum` hashes every resolved source file plus the
//! task's resolved variables and compares against the stored fingerprint;
//! `timestamp` compares the newest source mtime against the oldest-possible
//! generate mtime; `status` runs the task's shell predicates. A task that
//! declares both sources and status scripts is up to date only when both
//! agree.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::debug;

use crate::errors::{Result, TaskError};
use crate::exec::script_succeeds;
use crate::fingerprint::store::FingerprintStore;
use crate::taskfile::model::Method;

/// Expand glob patterns relative to `dir` into a sorted list of existing
/// files. Patterns with no matches contribute nothing.
pub fn expand_globs(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for pattern in patterns {
        let full = if Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            dir.join(pattern).display().to_string()
        };

        let matches = glob::glob(&full)
            .with_context(|| format!("invalid glob pattern {pattern:?}"))
            .map_err(TaskError::Internal)?;

        for entry in matches {
            let path = entry
                .with_context(|| format!("reading glob match for {pattern:?}"))
                .map_err(TaskError::Internal)?;
            if path.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Compute the aggregate checksum for a set of source files and the task's
/// resolved variables. Per-file hashes are computed independently and folded
/// into one digest in sorted path order, so the result is independent of
/// enumeration order.
pub fn checksum_of(files: &[PathBuf], vars: &BTreeMap<String, String>) -> Result<String> {
    let mut outer = blake3::Hasher::new();

    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();

    for path in sorted {
        let mut file_hasher = blake3::Hasher::new();
        let mut file = File::open(path)
            .with_context(|| format!("opening source file {path:?}"))
            .map_err(TaskError::Internal)?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("reading source file {path:?}"))
                .map_err(TaskError::Internal)?;
            if n == 0 {
                break;
            }
            file_hasher.update(&buf[..n]);
        }
        outer.update(file_hasher.finalize().as_bytes());
    }

    for (k, v) in vars {
        outer.update(k.as_bytes());
        outer.update(b"=");
        outer.update(v.as_bytes());
        outer.update(b"\n");
    }

    Ok(outer.finalize().to_hex().to_string())
}

/// Newest modification time among the given files.
pub fn newest_mtime(files: &[PathBuf]) -> Option<SystemTime> {
    files
        .iter()
        .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
        .max()
}

/// Newest source mtime rendered as unix seconds, for the `TIMESTAMP` special
/// variable.
pub fn timestamp_of(files: &[PathBuf]) -> String {
    newest_mtime(files)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|| "0".to_string())
}

/// Inputs for one up-to-date decision, borrowed from a compiled task.
#[derive(Debug)]
pub struct Fingerprint<'a> {
    pub key: &'a str,
    pub method: Method,
    pub dir: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    /// Resolved source files.
    pub sources: &'a [PathBuf],
    /// Whether the task declared any source patterns at all (an empty
    /// expansion of declared patterns is still a fingerprintable state).
    pub has_sources: bool,
    /// Generate patterns (not files: they may not exist yet).
    pub generates: &'a [String],
    pub status: &'a [String],
    pub resolved_vars: &'a BTreeMap<String, String>,
}

/// Decide whether the task is up to date.
pub async fn is_up_to_date(fp: &Fingerprint<'_>, store: &FingerprintStore) -> Result<bool> {
    let mut any_check = false;

    if !fp.status.is_empty() {
        any_check = true;
        for script in fp.status {
            if !script_succeeds(script, fp.dir, fp.env).await? {
                debug!(status = %script, "status script failed; task is stale");
                return Ok(false);
            }
        }
    }

    if fp.has_sources {
        any_check = true;
        let fresh = match fp.method {
            Method::Checksum => checksum_up_to_date(fp, store)?,
            Method::Timestamp => timestamp_up_to_date(fp)?,
            Method::None => false,
        };
        if !fresh {
            return Ok(false);
        }
    }

    Ok(any_check)
}

fn checksum_up_to_date(fp: &Fingerprint<'_>, store: &FingerprintStore) -> Result<bool> {
    let stored = match store.read(fp.key)? {
        Some(stored) => stored,
        None => return Ok(false),
    };
    let current = checksum_of(fp.sources, fp.resolved_vars)?;
    if stored != current {
        return Ok(false);
    }
    generates_exist(fp)
}

fn timestamp_up_to_date(fp: &Fingerprint<'_>) -> Result<bool> {
    let generated = expand_globs(fp.dir, fp.generates)?;
    if generated.is_empty() {
        return Ok(false);
    }
    if !generates_exist(fp)? {
        return Ok(false);
    }
    let newest_source = newest_mtime(fp.sources);
    let newest_generated = newest_mtime(&generated);
    match (newest_source, newest_generated) {
        (Some(src), Some(generated)) => Ok(generated >= src),
        (None, Some(_)) => Ok(true),
        _ => Ok(false),
    }
}

/// Every generate pattern must match at least one existing file. Tasks with
/// no `generates` pass trivially.
fn generates_exist(fp: &Fingerprint<'_>) -> Result<bool> {
    for pattern in fp.generates {
        let matches = expand_globs(fp.dir, std::slice::from_ref(pattern))?;
        if matches.is_empty() {
            // Literal paths (no glob metacharacters) may simply not exist.
            debug!(pattern = %pattern, "generate target missing; task is stale");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Persist the fingerprint after a successful run. Only the checksum method
/// stores anything; timestamps live in the generated files themselves.
pub fn persist(fp: &Fingerprint<'_>, store: &FingerprintStore) -> Result<()> {
    if !fp.has_sources || fp.method != Method::Checksum {
        return Ok(());
    }
    let current = checksum_of(fp.sources, fp.resolved_vars)?;
    let written = store.write_if_changed(fp.key, &current)?;
    debug!(key = %fp.key, written, "persisted fingerprint");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp<'a>(
        dir: &'a Path,
        sources: &'a [PathBuf],
        generates: &'a [String],
        status: &'a [String],
        vars: &'a BTreeMap<String, String>,
        env: &'a BTreeMap<String, String>,
        method: Method,
    ) -> Fingerprint<'a> {
        Fingerprint {
            key: "t",
            method,
            dir,
            env,
            sources,
            has_sources: !sources.is_empty(),
            generates,
            status,
            resolved_vars: vars,
        }
    }

    #[test]
    fn checksum_is_order_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("b.txt");
        std::fs::write(&a, "aaa").unwrap();
        std::fs::write(&b, "bbb").unwrap();

        let vars = BTreeMap::new();
        let fwd = checksum_of(&[a.clone(), b.clone()], &vars).unwrap();
        let rev = checksum_of(&[b, a], &vars).unwrap();
        assert_eq!(fwd, rev);
    }

    #[test]
    fn checksum_tracks_content_and_vars() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.txt");
        std::fs::write(&a, "one").unwrap();

        let vars = BTreeMap::new();
        let before = checksum_of(&[a.clone()], &vars).unwrap();
        std::fs::write(&a, "two").unwrap();
        let after = checksum_of(&[a.clone()], &vars).unwrap();
        assert_ne!(before, after);

        let mut vars = BTreeMap::new();
        vars.insert("MODE".to_string(), "release".to_string());
        let with_vars = checksum_of(&[a], &vars).unwrap();
        assert_ne!(after, with_vars);
    }

    #[test]
    fn glob_expansion_is_sorted_and_relative_to_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/b.c"), "b").unwrap();
        std::fs::write(tmp.path().join("src/a.c"), "a").unwrap();
        std::fs::write(tmp.path().join("src/a.h"), "h").unwrap();

        let files = expand_globs(tmp.path(), &["src/*.c".to_string()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.c", "b.c"]);
    }

    #[tokio::test]
    async fn checksum_method_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(tmp.path().join(".taskdag"));
        let src = tmp.path().join("in.txt");
        std::fs::write(&src, "input").unwrap();
        let gen = tmp.path().join("out.txt");
        std::fs::write(&gen, "output").unwrap();

        let sources = vec![src.clone()];
        let generates = vec!["out.txt".to_string()];
        let vars = BTreeMap::new();
        let env = BTreeMap::new();
        let status: Vec<String> = vec![];

        let f = fp(tmp.path(), &sources, &generates, &status, &vars, &env, Method::Checksum);
        assert!(!is_up_to_date(&f, &store).await.unwrap());

        persist(&f, &store).unwrap();
        assert!(is_up_to_date(&f, &store).await.unwrap());

        std::fs::write(&src, "changed").unwrap();
        assert!(!is_up_to_date(&f, &store).await.unwrap());
    }

    #[tokio::test]
    async fn checksum_requires_generates_to_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(tmp.path().join(".taskdag"));
        let src = tmp.path().join("in.txt");
        std::fs::write(&src, "input").unwrap();

        let sources = vec![src];
        let generates = vec!["missing.txt".to_string()];
        let vars = BTreeMap::new();
        let env = BTreeMap::new();
        let status: Vec<String> = vec![];

        let f = fp(tmp.path(), &sources, &generates, &status, &vars, &env, Method::Checksum);
        persist(&f, &store).unwrap();
        assert!(!is_up_to_date(&f, &store).await.unwrap());
    }

    #[tokio::test]
    async fn timestamp_method_compares_mtimes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(tmp.path().join(".taskdag"));
        let src = tmp.path().join("in.txt");
        let out = tmp.path().join("out.txt");
        std::fs::write(&src, "input").unwrap();
        std::fs::write(&out, "output").unwrap();

        let sources = vec![src.clone()];
        let generates = vec!["out.txt".to_string()];
        let vars = BTreeMap::new();
        let env = BTreeMap::new();
        let status: Vec<String> = vec![];

        let f = fp(tmp.path(), &sources, &generates, &status, &vars, &env, Method::Timestamp);
        assert!(is_up_to_date(&f, &store).await.unwrap());

        // Touch the source after the generate.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&src, "newer").unwrap();
        assert!(!is_up_to_date(&f, &store).await.unwrap());
    }

    #[tokio::test]
    async fn status_scripts_gate_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(tmp.path().join(".taskdag"));
        let vars = BTreeMap::new();
        let env = BTreeMap::new();
        let sources: Vec<PathBuf> = vec![];
        let generates: Vec<String> = vec![];

        let passing = vec!["true".to_string()];
        let f = fp(tmp.path(), &sources, &generates, &passing, &vars, &env, Method::Checksum);
        assert!(is_up_to_date(&f, &store).await.unwrap());

        let failing = vec!["true".to_string(), "false".to_string()];
        let f = fp(tmp.path(), &sources, &generates, &failing, &vars, &env, Method::Checksum);
        assert!(!is_up_to_date(&f, &store).await.unwrap());
    }

    #[tokio::test]
    async fn method_none_is_never_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(tmp.path().join(".taskdag"));
        let src = tmp.path().join("in.txt");
        std::fs::write(&src, "x").unwrap();

        let sources = vec![src];
        let generates: Vec<String> = vec![];
        let status: Vec<String> = vec![];
        let vars = BTreeMap::new();
        let env = BTreeMap::new();

        let f = fp(tmp.path(), &sources, &generates, &status, &vars, &env, Method::None);
        assert!(!is_up_to_date(&f, &store).await.unwrap());
    }
}
