// src/taskfile/remote.rs

//! Fetching and caching of remote taskfiles.
//!
//! Remote includes are cached under `<remote_cache>/<blake3(url)>.yml` so a
//! later `--offline` run can work without network access. When a fresh
//! download differs from the cached copy, the user must approve the
//! replacement before it is used (suppressed by `--yes`).

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info};

use crate::errors::{Result, TaskError};

/// Fetch policy derived from executor options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemotePolicy {
    /// Allow plain-HTTP URLs.
    pub insecure: bool,
    /// Never touch the network.
    pub offline: bool,
    /// Refetch even when a cache entry exists.
    pub download: bool,
    /// Auto-approve cache replacement prompts.
    pub assume_yes: bool,
}

/// Cache of downloaded taskfile bodies, serialized per URL by the loader
/// (taskfiles load sequentially during Setup).
pub struct RemoteCache {
    dir: PathBuf,
    client: reqwest::Client,
}

impl RemoteCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            client: reqwest::Client::new(),
        }
    }

    /// Return the taskfile body for `url` according to `policy`.
    pub async fn fetch(&self, url: &str, policy: &RemotePolicy) -> Result<String> {
        if url.starts_with("http://") && !policy.insecure {
            return Err(TaskError::InsecureRemote { url: url.to_string() });
        }

        let cache_path = self.cache_path(url);
        let cached = read_cached(&cache_path)?;

        if policy.offline {
            return cached.ok_or_else(|| TaskError::OfflineCacheMiss { url: url.to_string() });
        }

        if let (false, Some(body)) = (policy.download, &cached) {
            debug!(url = %url, path = ?cache_path, "using cached remote taskfile");
            return Ok(body.clone());
        }

        let body = self.download(url).await?;

        match cached {
            Some(ref old) if old == &body => {
                debug!(url = %url, "remote taskfile unchanged");
            }
            Some(_) => {
                // Content changed since we last approved it.
                if !policy.assume_yes && !prompt_approval(url)? {
                    return Err(TaskError::PromptDenied);
                }
                self.store(&cache_path, &body)?;
                info!(url = %url, "updated cached remote taskfile");
            }
            None => {
                self.store(&cache_path, &body)?;
                info!(url = %url, path = ?cache_path, "cached remote taskfile");
            }
        }

        Ok(body)
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        let digest = blake3::hash(url.as_bytes()).to_hex();
        self.dir.join(format!("{digest}.yml"))
    }

    async fn download(&self, url: &str) -> Result<String> {
        debug!(url = %url, "downloading remote taskfile");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TaskError::RemoteFetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TaskError::RemoteFetch {
                url: url.to_string(),
                reason: format!("server returned {}", response.status()),
            });
        }

        response.text().await.map_err(|e| TaskError::RemoteFetch {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    fn store(&self, path: &Path, body: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating remote cache directory {:?}", self.dir))
            .map_err(TaskError::Internal)?;
        // Write-temp-rename so a crash never leaves a torn cache entry.
        let tmp = path.with_extension("yml.tmp");
        std::fs::write(&tmp, body)
            .and_then(|_| std::fs::rename(&tmp, path))
            .with_context(|| format!("writing remote cache entry {path:?}"))
            .map_err(TaskError::Internal)
    }
}

fn read_cached(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("reading remote cache entry {path:?}"))
        .map_err(TaskError::Internal)
}

/// Ask the user whether a changed remote taskfile may replace the cached one.
fn prompt_approval(url: &str) -> Result<bool> {
    let mut stderr = std::io::stderr();
    write!(
        stderr,
        "taskdag: remote taskfile {url} has changed since it was cached. Accept the new version? [y/N] "
    )
    .and_then(|_| stderr.flush())
    .context("writing prompt")
    .map_err(TaskError::Internal)?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading prompt answer")
        .map_err(TaskError::Internal)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_paths_are_stable_and_distinct() {
        let cache = RemoteCache::new(PathBuf::from("/tmp/cache"));
        let a1 = cache.cache_path("https://example.com/a.yml");
        let a2 = cache.cache_path("https://example.com/a.yml");
        let b = cache.cache_path("https://example.com/b.yml");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.extension().is_some());
    }

    #[tokio::test]
    async fn insecure_urls_are_refused_without_opt_in() {
        let cache = RemoteCache::new(PathBuf::from("/tmp/cache"));
        let err = cache
            .fetch("http://example.com/T.yml", &RemotePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InsecureRemote { .. }));
    }

    #[tokio::test]
    async fn offline_without_cache_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RemoteCache::new(dir.path().to_path_buf());
        let policy = RemotePolicy {
            offline: true,
            ..RemotePolicy::default()
        };
        let err = cache
            .fetch("https://example.com/T.yml", &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::OfflineCacheMiss { .. }));
    }

    #[tokio::test]
    async fn offline_with_cache_uses_it() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RemoteCache::new(dir.path().to_path_buf());
        let url = "https://example.com/T.yml";
        let path = cache.cache_path(url);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&path, "version: 3\n").unwrap();

        let policy = RemotePolicy {
            offline: true,
            ..RemotePolicy::default()
        };
        let body = cache.fetch(url, &policy).await.unwrap();
        assert_eq!(body, "version: 3\n");
    }
}
