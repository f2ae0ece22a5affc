// src/taskfile/dotenv.rs

//! Minimal dotenv parsing for the root taskfile's `dotenv:` list.
//!
//! Supports `KEY=VALUE` lines, an optional `export ` prefix, single and
//! double quoting, `#` comments, and blank lines. Values are not interpolated
//! here; they enter the variable scope below file-level vars and above the
//! process environment.

use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{Result, TaskError};

/// Parse dotenv content into a key/value map. Later lines win.
pub fn parse_str(path_for_errors: &str, content: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let (key, value) = line.split_once('=').ok_or_else(|| TaskError::DotenvParse {
            path: path_for_errors.to_string(),
            reason: format!("line {}: expected KEY=VALUE, got {:?}", lineno + 1, raw),
        })?;

        let key = key.trim();
        if key.is_empty() || !is_valid_key(key) {
            return Err(TaskError::DotenvParse {
                path: path_for_errors.to_string(),
                reason: format!("line {}: invalid key {:?}", lineno + 1, key),
            });
        }

        out.insert(key.to_string(), unquote(value.trim()));
    }

    Ok(out)
}

/// Read and parse a dotenv file. Missing files yield `None`; unreadable or
/// malformed files are errors.
pub fn load_file(path: &Path) -> Result<Option<BTreeMap<String, String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| TaskError::DotenvParse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_str(&path.display().to_string(), &content).map(Some)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            let inner = &value[1..value.len() - 1];
            if first == b'"' {
                return inner.replace("\\n", "\n").replace("\\\"", "\"");
            }
            return inner.to_string();
        }
    }
    // Unquoted values lose trailing comments.
    match value.split_once(" #") {
        Some((v, _)) => v.trim_end().to_string(),
        None => value.to_string(),
    }
}
