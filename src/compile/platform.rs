// src/compile/platform.rs

//! Platform detection for `platforms:` filters.

use std::env;

use crate::taskfile::model::Platform;

/// Current OS in taskfile vocabulary (`linux`, `darwin`, `windows`, ...).
pub fn current_os() -> &'static str {
    match env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Current architecture in taskfile vocabulary (`amd64`, `arm64`, ...).
pub fn current_arch() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// Whether the current machine matches the filter. An empty filter matches
/// everything; otherwise any one entry matching suffices.
pub fn matches_current(platforms: &[Platform]) -> bool {
    if platforms.is_empty() {
        return true;
    }
    platforms.iter().any(matches_one)
}

fn matches_one(platform: &Platform) -> bool {
    let os_ok = platform
        .os
        .as_deref()
        .map(|os| os == current_os())
        .unwrap_or(true);
    let arch_ok = platform
        .arch
        .as_deref()
        .map(|arch| arch == current_arch())
        .unwrap_or(true);
    os_ok && arch_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches() {
        assert!(matches_current(&[]));
    }

    #[test]
    fn matching_os_passes_and_foreign_os_fails() {
        let this = Platform {
            os: Some(current_os().to_string()),
            arch: None,
        };
        assert!(matches_current(&[this]));

        let foreign_os = if current_os() == "windows" { "linux" } else { "windows" };
        let other = Platform {
            os: Some(foreign_os.to_string()),
            arch: None,
        };
        assert!(!matches_current(&[other]));
    }

    #[test]
    fn any_entry_matching_suffices() {
        let foreign = Platform {
            os: Some("windows".to_string()),
            arch: Some("386".to_string()),
        };
        let this = Platform {
            os: Some(current_os().to_string()),
            arch: Some(current_arch().to_string()),
        };
        assert!(matches_current(&[foreign, this]));
    }
}
