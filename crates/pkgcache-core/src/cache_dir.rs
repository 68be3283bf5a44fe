//! Cache root ownership.
//!
//! The owner of the cache directory is computed once per process. An existing
//! directory's owner is authoritative; a new directory is created for the
//! invoking user (the `sudo` caller when running as root under `sudo`).

use crate::error::{CacheError, IoResultExt, Result};
use crate::inflight::Inflight;
use pkgcache_util::fs::{chownr, mkdirp};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, trace};

const MAKE_CACHE_DIR_KEY: &str = "makeCacheDir";

/// Owner of the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStat {
    pub uid: u32,
    pub gid: u32,
}

/// Identity of the running process, as far as cache ownership is concerned.
#[derive(Debug, Clone, Default)]
pub struct ProcessOwner {
    pub uid: u32,
    pub gid: u32,
    pub sudo_uid: Option<u32>,
    pub sudo_gid: Option<u32>,
    pub home: Option<PathBuf>,
}

impl ProcessOwner {
    /// Read the current process identity and `SUDO_UID`/`SUDO_GID`/`HOME`.
    #[must_use]
    pub fn current() -> Self {
        let (uid, gid) = process_ids();
        Self {
            uid,
            gid,
            sudo_uid: env_id("SUDO_UID"),
            sudo_gid: env_id("SUDO_GID"),
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// Owner a freshly created cache directory should get.
    ///
    /// # Errors
    /// Returns an error if running as root without `sudo` and `HOME` cannot be
    /// inspected.
    pub fn target(&self) -> Result<CacheStat> {
        if self.uid != 0 {
            return Ok(CacheStat {
                uid: self.uid,
                gid: self.gid,
            });
        }
        if let (Some(uid), Some(gid)) = (self.sudo_uid, self.sudo_gid) {
            return Ok(CacheStat { uid, gid });
        }
        match &self.home {
            Some(home) => {
                let meta = std::fs::metadata(home).with_path(home)?;
                Ok(stat_from_metadata(&meta))
            }
            None => Ok(CacheStat {
                uid: self.uid,
                gid: self.gid,
            }),
        }
    }
}

fn env_id(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(unix)]
fn process_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid take no arguments and cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn process_ids() -> (u32, u32) {
    (0, 0)
}

#[cfg(unix)]
fn stat_from_metadata(meta: &std::fs::Metadata) -> CacheStat {
    use std::os::unix::fs::MetadataExt;
    CacheStat {
        uid: meta.uid(),
        gid: meta.gid(),
    }
}

#[cfg(not(unix))]
fn stat_from_metadata(_meta: &std::fs::Metadata) -> CacheStat {
    CacheStat { uid: 0, gid: 0 }
}

/// The cache root plus its memoized owner.
#[derive(Debug)]
pub struct CacheDir {
    root: PathBuf,
    owner: ProcessOwner,
    stat: OnceLock<CacheStat>,
    inflight: Inflight<CacheStat>,
}

impl CacheDir {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_owner(root, ProcessOwner::current())
    }

    #[must_use]
    pub fn with_owner(root: impl Into<PathBuf>, owner: ProcessOwner) -> Self {
        Self {
            root: root.into(),
            owner,
            stat: OnceLock::new(),
            inflight: Inflight::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the cache root exists and return its owner.
    ///
    /// Only the first call touches the filesystem; concurrent first calls
    /// share one computation.
    pub async fn stat(&self) -> Result<CacheStat> {
        if let Some(stat) = self.stat.get() {
            return Ok(*stat);
        }

        let root = self.root.clone();
        let owner = self.owner.clone();
        let stat = self
            .inflight
            .run(MAKE_CACHE_DIR_KEY, || async move {
                tokio::task::spawn_blocking(move || compute_stat(&root, &owner))
                    .await
                    .map_err(|e| CacheError::io(PathBuf::new(), std::io::Error::other(e)))?
            })
            .await?;

        Ok(*self.stat.get_or_init(|| stat))
    }

    /// Create `dir` (and parents) and hand the new directories to the cache owner.
    pub async fn make_dir(&self, dir: &Path) -> Result<CacheStat> {
        let stat = self.stat().await?;
        if let Some(created) = mkdirp(dir).with_path(dir)? {
            self.fix_owner(&created, stat)?;
        }
        Ok(stat)
    }

    /// Re-own `path` recursively when running as root and the owner differs.
    pub fn fix_owner(&self, path: &Path, stat: CacheStat) -> Result<()> {
        if self.owner.uid != 0 || (stat.uid == self.owner.uid && stat.gid == self.owner.gid) {
            return Ok(());
        }
        trace!(path = %path.display(), uid = stat.uid, gid = stat.gid, "chownr");
        chownr(path, stat.uid, stat.gid).with_path(path)
    }
}

fn compute_stat(root: &Path, owner: &ProcessOwner) -> Result<CacheStat> {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(stat_from_metadata(&meta)),
        Ok(_) => Err(CacheError::BadCacheDir {
            path: root.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => make_cache_dir(root, owner),
        Err(e) => Err(CacheError::io(root, e)),
    }
}

fn make_cache_dir(root: &Path, owner: &ProcessOwner) -> Result<CacheStat> {
    let stat = owner.target()?;
    debug!(root = %root.display(), uid = stat.uid, gid = stat.gid, "creating cache dir");

    if let Some(created) = mkdirp(root).with_path(root)? {
        if owner.uid == 0 && (stat.uid != owner.uid || stat.gid != owner.gid) {
            chownr(&created, stat.uid, stat.gid).with_path(&created)?;
        }
    }
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn user(uid: u32, gid: u32) -> ProcessOwner {
        ProcessOwner {
            uid,
            gid,
            ..ProcessOwner::default()
        }
    }

    #[test]
    fn test_target_non_root_uses_process_ids() {
        assert_eq!(user(501, 20).target().unwrap(), CacheStat { uid: 501, gid: 20 });
    }

    #[test]
    fn test_target_root_under_sudo() {
        let owner = ProcessOwner {
            sudo_uid: Some(1000),
            sudo_gid: Some(1000),
            ..user(0, 0)
        };
        assert_eq!(
            owner.target().unwrap(),
            CacheStat {
                uid: 1000,
                gid: 1000
            }
        );
    }

    #[test]
    fn test_target_root_missing_home_propagates() {
        let owner = ProcessOwner {
            home: Some(PathBuf::from("/nonexistent/home/for/test")),
            ..user(0, 0)
        };
        let err = owner.target().unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stat_creates_missing_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("a").join("cache");
        let (uid, gid) = process_ids();
        let cache = CacheDir::with_owner(&root, user(uid, gid));

        let stat = cache.stat().await.unwrap();
        assert!(root.is_dir());
        assert_eq!(stat, CacheStat { uid, gid });
    }

    #[tokio::test]
    async fn test_stat_rejects_file_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        std::fs::write(&root, "not a dir").unwrap();

        let cache = CacheDir::new(&root);
        let err = cache.stat().await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::EBADCACHE);
    }

    #[tokio::test]
    async fn test_stat_is_memoized() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = Arc::new(CacheDir::new(&root));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.stat().await.unwrap() })
            })
            .collect();
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));

        // Removing the directory does not change the memoized answer
        std::fs::remove_dir_all(&root).unwrap();
        assert_eq!(cache.stat().await.unwrap(), results[0]);
    }
}
