//! The `CacheService` façade.
//!
//! One `CacheService` is built per process from a [`CacheConfig`]. It owns
//! everything that is computed once and shared (cache directory ownership,
//! the registry client, the in-flight tables, the lock table) and is passed
//! by reference into every add/read/list/clean operation.

use crate::cache_dir::CacheDir;
use crate::config::CacheConfig;
use crate::error::{CacheError, IoResultExt, Result};
use crate::git::GitRunner;
use crate::inflight::Inflight;
use crate::locker::Locker;
use crate::paths::{manifest_path, package_dir, package_root, tarball_path, GIT_REMOTES_DIR, LOCKS_DIR};
use crate::registry::{CachingClient, Manifest, RegistryClient};
use crate::spec::{PackageSpecifier, SpecKind};
use crate::store::tarball::extract_tgz_atomic;
use crate::store::write_manifest;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct ServiceInner {
    pub(crate) config: Arc<CacheConfig>,
    pub(crate) cache_dir: Arc<CacheDir>,
    pub(crate) registry: CachingClient,
    pub(crate) locker: Locker,
    pub(crate) git: GitRunner,
    /// `named:{name}@{spec}` resolutions.
    pub(crate) named: Inflight<Manifest>,
    /// Tarball fetches, keyed by URL or local path.
    pub(crate) tarballs: Inflight<Manifest>,
    /// Git remote syncs, keyed by repo id.
    pub(crate) git_remotes: Inflight<Manifest>,
}

/// Entry point for every cache operation. Cheap to clone.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("cache_root", &self.inner.config.cache_root)
            .field("registry", &self.inner.config.registry.as_str())
            .finish_non_exhaustive()
    }
}

/// A cached `name@version` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CachedPackage {
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for CachedPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl CacheService {
    /// Build the service. Nothing is touched on disk until the first
    /// operation needs the cache root.
    ///
    /// # Errors
    /// [`CacheError::BadCacheDir`] if the cache root exists but is not a
    /// directory; HTTP client construction errors (bad proxy URL).
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.cache_root.exists() && !config.cache_root.is_dir() {
            return Err(CacheError::BadCacheDir {
                path: config.cache_root.clone(),
            });
        }

        let config = Arc::new(config);
        let cache_dir = Arc::new(CacheDir::new(&config.cache_root));
        let client = RegistryClient::new(Arc::clone(&config))?;
        let registry = CachingClient::new(client, Arc::clone(&config), Arc::clone(&cache_dir));
        let locker = Locker::new(&config.cache_root, config.lock);
        let git = GitRunner::new(&config.git);

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                cache_dir,
                registry,
                locker,
                git,
                named: Inflight::new(),
                tarballs: Inflight::new(),
                git_remotes: Inflight::new(),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &ServiceInner {
        &self.inner
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The caching registry client.
    #[must_use]
    pub fn registry(&self) -> &CachingClient {
        &self.inner.registry
    }

    #[must_use]
    pub fn cache_dir(&self) -> &CacheDir {
        &self.inner.cache_dir
    }

    #[must_use]
    pub fn locker(&self) -> &Locker {
        &self.inner.locker
    }

    pub(crate) fn git(&self) -> &GitRunner {
        &self.inner.git
    }

    /// Add whatever `spec` refers to and stamp `_from` with its text.
    ///
    /// # Errors
    /// Whatever the underlying add operation reports.
    pub async fn add(&self, spec: &PackageSpecifier) -> Result<Manifest> {
        debug!(spec = %spec, kind = ?spec.kind, "add");
        let mut manifest = match &spec.kind {
            SpecKind::Version { name, version } => self.add_named(name, version).await?,
            SpecKind::Range { name, range } => self.add_named(name, range).await?,
            SpecKind::Tag { name, tag } => {
                self.add_named(name, tag.as_deref().unwrap_or("")).await?
            }
            SpecKind::Remote { url } => self.add_remote_tarball(url, None, None).await?,
            SpecKind::Git { url } => self.add_remote_git(url).await?,
            SpecKind::LocalTarball { path } => self.add_local_tarball(path, None, None).await?,
            SpecKind::Directory { path } => {
                self.add_local_directory(path, None, None, None).await?
            }
        };

        if manifest.from.as_deref() != Some(spec.raw.as_str()) {
            manifest.from = Some(spec.raw.clone());
            let path = manifest_path(&self.config().cache_root, &manifest.name, &manifest.version)?;
            if path.is_file() {
                write_manifest(&path, &manifest)?;
            }
        }
        info!(id = %manifest.spec_id(), "added");
        Ok(manifest)
    }

    /// Manifest of a cached `name@version`; fetches it when missing or when
    /// `bypass` is set.
    ///
    /// # Errors
    /// See [`Self::add_named`].
    pub async fn read(&self, name: &str, version: &str, bypass: bool) -> Result<Manifest> {
        if !bypass {
            if let Some(manifest) = self.cached_manifest(name, version) {
                debug!(id = %manifest.spec_id(), "read from cache");
                return Ok(manifest);
            }
        }
        self.add_named(name, version).await
    }

    /// Every cached `name@version` whose id starts with `prefix` (all when
    /// `None`), sorted.
    ///
    /// # Errors
    /// I/O errors reading the cache root.
    pub fn ls(&self, prefix: Option<&str>) -> Result<Vec<CachedPackage>> {
        let root = &self.config().cache_root;
        let mut found = Vec::new();
        if !root.is_dir() {
            return Ok(found);
        }
        scan_packages(root, None, &mut found)?;

        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            found.retain(|p| p.name == prefix || p.to_string().starts_with(prefix));
        }
        found.sort();
        Ok(found)
    }

    /// Remove cache contents.
    ///
    /// `None` empties the cache (git mirrors included) but keeps the root.
    /// `name` removes every cached version; `name@version` removes one.
    ///
    /// # Errors
    /// I/O errors while removing.
    pub fn clean(&self, target: Option<&str>) -> Result<()> {
        let root = &self.config().cache_root;
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            if !root.is_dir() {
                return Ok(());
            }
            for entry in fs::read_dir(root).with_path(root)? {
                let path = entry.with_path(root)?.path();
                remove_path(&path)?;
            }
            info!(root = %root.display(), "cache cleaned");
            return Ok(());
        };

        let (name, version) = split_name_version(target);
        let path = match version {
            Some(version) => package_root(root, name, version),
            None => package_dir(root, name),
        }
        .map_err(|e| CacheError::bad_spec(target, e.to_string()))?;
        remove_path(&path)?;
        info!(target = %target, "removed from cache");
        Ok(())
    }

    /// Make sure `name@version` is cached and extract it into `target`.
    ///
    /// `target` is replaced atomically.
    ///
    /// # Errors
    /// Fetch errors; [`CacheError::BadPackage`] for archives with unsafe paths.
    pub async fn unpack(&self, name: &str, version: &str, target: &Path) -> Result<Manifest> {
        let tgz = tarball_path(&self.config().cache_root, name, version)?;
        let manifest = if tgz.is_file() {
            self.read(name, version, false).await?
        } else {
            self.add_named(name, version).await?
        };
        let tgz = tarball_path(&self.config().cache_root, &manifest.name, &manifest.version)?;

        let dest = target.to_path_buf();
        tokio::task::spawn_blocking(move || extract_tgz_atomic(&tgz, &dest))
            .await
            .map_err(|e| CacheError::io(target, std::io::Error::other(e)))??;
        debug!(id = %manifest.spec_id(), target = %target.display(), "unpacked");
        Ok(manifest)
    }
}

/// Split `name@version`, keeping the leading `@` of scoped names.
fn split_name_version(target: &str) -> (&str, Option<&str>) {
    match target.rfind('@') {
        Some(at) if at > 0 => (&target[..at], Some(&target[at + 1..])),
        _ => (target, None),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(CacheError::io(path, e)),
        _ => Ok(()),
    }
}

fn scan_packages(dir: &Path, scope: Option<&str>, found: &mut Vec<CachedPackage>) -> Result<()> {
    for entry in fs::read_dir(dir).with_path(dir)?.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        // Bookkeeping dirs
        if name == GIT_REMOTES_DIR || name == LOCKS_DIR || name.starts_with(['_', '.']) {
            continue;
        }

        if scope.is_none() && name.starts_with('@') {
            scan_packages(&path, Some(&name), found)?;
            continue;
        }

        let pkg_name = match scope {
            Some(scope) => format!("{scope}/{name}"),
            None => name.to_string(),
        };

        // Registry host dirs hold `.cache.json` sidecars, never package.tgz,
        // so they fall out here.
        let Ok(versions) = fs::read_dir(&path) else {
            continue;
        };
        for version in versions.flatten() {
            let version_path = version.path();
            let is_package = version_path.join("package.tgz").is_file()
                || version_path.join("package").join("package.json").is_file();
            if is_package {
                found.push(CachedPackage {
                    name: pkg_name.clone(),
                    version: version.file_name().to_string_lossy().into_owned(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service(root: &Path) -> CacheService {
        let config = CacheConfig::new(root).with_tmp_root(root.join(".tmp"));
        CacheService::new(config).unwrap()
    }

    fn place(root: &Path, name: &str, version: &str) {
        let dir = package_root(root, name, version).unwrap();
        fs::create_dir_all(dir.join("package")).unwrap();
        fs::write(dir.join("package.tgz"), b"tgz").unwrap();
        fs::write(
            dir.join("package").join("package.json"),
            format!(r#"{{"name":"{name}","version":"{version}"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn test_rejects_file_as_cache_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();
        let err = CacheService::new(CacheConfig::new(&file)).unwrap_err();
        assert_eq!(err.code(), "EBADCACHE");
    }

    #[test]
    fn test_ls_skips_bookkeeping_and_host_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        place(root, "react", "18.2.0");
        place(root, "@types/node", "20.1.0");
        fs::create_dir_all(root.join("_git-remotes/x-12345678")).unwrap();
        fs::create_dir_all(root.join("_locks")).unwrap();
        fs::create_dir_all(root.join("registry.npmjs.org/react")).unwrap();
        fs::write(root.join("registry.npmjs.org/react/.cache.json"), b"{}").unwrap();

        let svc = service(root);
        let all: Vec<String> = svc.ls(None).unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(all, vec!["@types/node@20.1.0", "react@18.2.0"]);

        let scoped = svc.ls(Some("@types")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "@types/node");
    }

    #[test]
    fn test_ls_empty_cache() {
        let dir = tempdir().unwrap();
        let svc = service(&dir.path().join("missing"));
        assert!(svc.ls(None).unwrap().is_empty());
    }

    #[test]
    fn test_clean_version_package_and_all() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        place(root, "a", "1.0.0");
        place(root, "a", "2.0.0");
        place(root, "@s/b", "1.0.0");
        fs::create_dir_all(root.join("_git-remotes/x")).unwrap();
        let svc = service(root);

        svc.clean(Some("a@1.0.0")).unwrap();
        assert!(!package_root(root, "a", "1.0.0").unwrap().exists());
        assert!(package_root(root, "a", "2.0.0").unwrap().exists());

        svc.clean(Some("@s/b")).unwrap();
        assert!(!root.join("@s/b").exists());

        svc.clean(None).unwrap();
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(root).unwrap().count(), 0);
    }

    #[test]
    fn test_clean_rejects_bookkeeping_names() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        assert!(svc.clean(Some("_locks")).is_err());
        assert!(svc.clean(Some("../etc")).is_err());
        assert_eq!(svc.clean(Some("a@../../x")).unwrap_err().code(), "EBADSPEC");
    }

    #[test]
    fn test_split_name_version() {
        assert_eq!(split_name_version("a@1.0.0"), ("a", Some("1.0.0")));
        assert_eq!(split_name_version("@s/b@2.0.0"), ("@s/b", Some("2.0.0")));
        assert_eq!(split_name_version("@s/b"), ("@s/b", None));
        assert_eq!(split_name_version("plain"), ("plain", None));
    }

    #[tokio::test]
    async fn test_read_prefers_cache() {
        let dir = tempdir().unwrap();
        place(dir.path(), "cached", "1.0.0");
        let svc = service(dir.path());
        let manifest = svc.read("cached", "1.0.0", false).await.unwrap();
        assert_eq!(manifest.spec_id(), "cached@1.0.0");
    }
}
