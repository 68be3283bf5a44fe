//! Advisory lock files for cross-process cache safety.
//!
//! A lock for a target path is a file under `{cache}/_locks/` whose name is
//! derived from the path. Acquisition creates it exclusively; a lock older
//! than the configured staleness is considered abandoned and broken.

use crate::config::LockConfig;
use crate::error::{CacheError, IoResultExt, Result};
use crate::paths::locks_dir;
use pkgcache_util::slug::hashed_id;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file path for `target`.
#[must_use]
pub fn lock_file_for(cache_root: &Path, target: &str) -> PathBuf {
    let id = hashed_id(target, target, Some(24), 16);
    locks_dir(cache_root).join(format!("{id}.lock"))
}

/// Acquires and releases lock files under one cache root.
#[derive(Debug, Clone)]
pub struct Locker {
    cache_root: PathBuf,
    config: LockConfig,
}

impl Locker {
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            cache_root: cache_root.into(),
            config,
        }
    }

    /// Acquire the lock for `target`, waiting and retrying per [`LockConfig`].
    ///
    /// # Errors
    /// Returns [`CacheError::Locked`] if the lock is still held after every
    /// retry, or an I/O error if the lock directory cannot be written.
    pub async fn lock(&self, target: &str) -> Result<LockGuard> {
        let path = lock_file_for(&self.cache_root, target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }

        for attempt in 0..=self.config.retries {
            if try_create(&path)? {
                trace!(target = %target, lock = %path.display(), "locked");
                return Ok(LockGuard { path: Some(path) });
            }

            if self.break_if_stale(&path) {
                continue;
            }

            let deadline = tokio::time::Instant::now() + self.config.wait;
            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(POLL_INTERVAL.min(self.config.wait)).await;
                if !path.exists() {
                    break;
                }
            }
            debug!(target = %target, attempt, "lock busy");
        }

        Err(CacheError::Locked { path })
    }

    /// Remove `path` if it is older than the staleness threshold.
    fn break_if_stale(&self, path: &Path) -> bool {
        let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
            return false;
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age <= self.config.stale {
            return false;
        }
        warn!(lock = %path.display(), age_ms = age.as_millis() as u64, "breaking stale lock");
        std::fs::remove_file(path).is_ok()
    }
}

fn try_create(path: &Path) -> Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// A held lock; the file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: Option<PathBuf>,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(lock = %path.display(), error = %e, "failed to remove lock");
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}
