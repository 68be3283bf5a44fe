//! Placing tarballs and directories into the cache.

use super::tarball::{pack_directory, read_manifest};
use crate::error::{CacheError, IoResultExt, Result};
use crate::paths::{check_package_id, manifest_path, package_root, TARBALL_NAME};
use crate::registry::Manifest;
use crate::service::CacheService;
use pkgcache_util::fs::{atomic_copy, atomic_write, path_is_inside};
use pkgcache_util::hash::sha1_file;
use std::path::Path;
use tracing::{debug, trace};

impl CacheService {
    /// Add a tarball from disk.
    ///
    /// `pkg` carries whatever is already known about the package (name,
    /// version, registry metadata); when name or version is missing the
    /// tarball is unpacked and its `package.json` is used.
    ///
    /// # Errors
    /// [`CacheError::BadPackage`] when the tarball or its metadata is unusable.
    pub async fn add_local_tarball(
        &self,
        path: &Path,
        pkg: Option<Manifest>,
        shasum: Option<String>,
    ) -> Result<Manifest> {
        let resolved = path.display().to_string();
        self.add_local_tarball_resolved(path, pkg, shasum, &resolved)
            .await
    }

    pub(crate) async fn add_local_tarball_resolved(
        &self,
        path: &Path,
        pkg: Option<Manifest>,
        shasum: Option<String>,
        resolved: &str,
    ) -> Result<Manifest> {
        let shasum = match shasum {
            Some(sum) => sum,
            None => sha1_file(path).with_path(path)?,
        };

        let mut pkg = pkg.unwrap_or_default();
        if pkg.resolved.is_none() {
            pkg.resolved = Some(resolved.to_string());
        }

        let config = self.config();
        if path_is_inside(path, &config.cache_root) && !path_is_inside(path, &config.tmp_root) {
            if path.file_name().and_then(|n| n.to_str()) != Some(TARBALL_NAME) {
                return Err(CacheError::bad_package(format!(
                    "{} is inside the cache but is not a {TARBALL_NAME}",
                    path.display()
                )));
            }
            return self.add_placed_tarball(path, pkg, &shasum).await;
        }

        let key = format!("addTmpTarball:{}", path.display());
        self.inner()
            .tarballs
            .run(&key, || self.add_tmp_tarball(path, pkg, &shasum))
            .await
    }

    /// Copy a tarball from outside the cache to its canonical location.
    async fn add_tmp_tarball(&self, tmp: &Path, pkg: Manifest, shasum: &str) -> Result<Manifest> {
        let mut manifest = if !pkg.name.is_empty() && !pkg.version.is_empty() {
            pkg
        } else {
            let scratch = self.config().tmp_root.clone();
            let tmp_owned = tmp.to_path_buf();
            let found = tokio::task::spawn_blocking(move || read_manifest(&tmp_owned, &scratch))
                .await
                .map_err(|e| CacheError::io(tmp, std::io::Error::other(e)))??;
            check_identity(&pkg, &found)?;
            merge_known(found, pkg)
        };

        manifest.version = check_package_id(&manifest.name, &manifest.version)?;
        let root = package_root(&self.config().cache_root, &manifest.name, &manifest.version)?;
        let target = root.join(TARBALL_NAME);
        let _lock = self.locker().lock(&root.display().to_string()).await?;

        let stat = self.cache_dir().make_dir(&root).await?;
        if tmp != target {
            atomic_copy(tmp, &target).with_path(&target)?;
        }
        self.cache_dir().fix_owner(&target, stat)?;
        debug!(id = %manifest.spec_id(), target = %target.display(), "tarball placed");

        self.write_placed(&root, manifest, shasum).await
    }

    /// Record metadata for a tarball already at its canonical path.
    async fn add_placed_tarball(&self, tgz: &Path, pkg: Manifest, shasum: &str) -> Result<Manifest> {
        let mut manifest = if !pkg.name.is_empty() && !pkg.version.is_empty() {
            pkg
        } else {
            let found = read_manifest(tgz, &self.config().tmp_root)?;
            check_identity(&pkg, &found)?;
            merge_known(found, pkg)
        };

        manifest.version = check_package_id(&manifest.name, &manifest.version)?;
        let root = package_root(&self.config().cache_root, &manifest.name, &manifest.version)?;
        if tgz.parent() != Some(root.as_path()) {
            return Err(CacheError::bad_package(format!(
                "{} is not the cached tarball of {}",
                tgz.display(),
                manifest.spec_id()
            )));
        }
        let _lock = self.locker().lock(&root.display().to_string()).await?;
        self.write_placed(&root, manifest, shasum).await
    }

    /// Write `{root}/package/package.json` with the verified shasum.
    async fn write_placed(&self, root: &Path, mut manifest: Manifest, shasum: &str) -> Result<Manifest> {
        manifest.shasum = Some(shasum.to_string());
        manifest.ensure_id();

        let pkg_dir = root.join("package");
        let stat = self.cache_dir().make_dir(&pkg_dir).await?;
        let pkg_json = pkg_dir.join("package.json");
        write_manifest(&pkg_json, &manifest)?;
        self.cache_dir().fix_owner(root, stat)?;
        trace!(path = %pkg_json.display(), "wrote cached manifest");
        Ok(manifest)
    }

    /// Pack a package directory into the cache.
    ///
    /// `resolved` becomes `_resolved` (the directory path when `None`).
    ///
    /// # Errors
    /// [`CacheError::BadPackage`] when `package.json` is missing or lacks a
    /// name or version, [`CacheError::Integrity`] when `shasum` disagrees.
    pub async fn add_local_directory(
        &self,
        dir: &Path,
        pkg: Option<Manifest>,
        shasum: Option<String>,
        resolved: Option<String>,
    ) -> Result<Manifest> {
        let pkg_json = dir.join("package.json");
        let bytes = std::fs::read(&pkg_json).map_err(|e| {
            CacheError::bad_package(format!("{}: {e}", pkg_json.display()))
        })?;
        let mut manifest = Manifest::from_slice(&bytes)
            .map_err(|e| CacheError::bad_package(format!("{}: {e}", pkg_json.display())))?;
        if manifest.name.is_empty() || manifest.version.is_empty() {
            return Err(CacheError::bad_package(format!(
                "{} must have a name and version",
                pkg_json.display()
            )));
        }
        if let Some(known) = &pkg {
            check_identity(known, &manifest)?;
        }
        manifest.version = check_package_id(&manifest.name, &manifest.version)?;

        let root = package_root(&self.config().cache_root, &manifest.name, &manifest.version)?;
        let _lock = self.locker().lock(&root.display().to_string()).await?;
        let stat = self.cache_dir().make_dir(&root).await?;

        let staged = tempfile::Builder::new()
            .prefix(".package.tgz.")
            .tempfile_in(&root)
            .with_path(&root)?;
        let (src, staged_path) = (dir.to_path_buf(), staged.path().to_path_buf());
        tokio::task::spawn_blocking(move || pack_directory(&src, &staged_path))
            .await
            .map_err(|e| CacheError::io(dir, std::io::Error::other(e)))??;

        let actual = sha1_file(staged.path()).with_path(staged.path())?;
        if let Some(expected) = shasum.filter(|s| *s != actual) {
            return Err(CacheError::Integrity {
                path: dir.to_path_buf(),
                expected,
                actual,
                from: dir.display().to_string(),
            });
        }

        let target = root.join(TARBALL_NAME);
        staged
            .persist(&target)
            .map_err(|e| CacheError::io(&target, e.error))?;
        debug!(id = %manifest.spec_id(), dir = %dir.display(), "packed directory");

        manifest.resolved = Some(resolved.unwrap_or_else(|| dir.display().to_string()));
        if let Some(from) = pkg.and_then(|p| p.from) {
            manifest.from = Some(from);
        }
        let placed = self.write_placed(&root, manifest, &actual).await?;
        self.cache_dir().fix_owner(&root, stat)?;
        Ok(placed)
    }

    /// Cached manifest for `name@version`, if present on disk.
    pub(crate) fn cached_manifest(&self, name: &str, version: &str) -> Option<Manifest> {
        let path = manifest_path(&self.config().cache_root, name, version).ok()?;
        let bytes = std::fs::read(path).ok()?;
        let manifest = Manifest::from_slice(&bytes).ok()?;
        (!manifest.name.is_empty() && !manifest.version.is_empty()).then_some(manifest)
    }
}

/// Reject a tarball whose `package.json` disagrees with what the caller expected.
fn check_identity(expected: &Manifest, found: &Manifest) -> Result<()> {
    if found.name.is_empty() {
        return Err(CacheError::bad_package("package.json has no name"));
    }
    if found.version.is_empty() {
        return Err(CacheError::bad_package(format!(
            "{}: package.json has no version",
            found.name
        )));
    }
    if !expected.name.is_empty() && expected.name != found.name {
        return Err(CacheError::bad_package(format!(
            "expected name '{}' but found '{}'",
            expected.name, found.name
        )));
    }
    if !expected.version.is_empty() && expected.version != found.version {
        return Err(CacheError::bad_package(format!(
            "expected version '{}' of {} but found '{}'",
            expected.version, found.name, found.version
        )));
    }
    Ok(())
}

/// Carry the caller's bookkeeping fields over to a manifest read from disk.
fn merge_known(mut found: Manifest, known: Manifest) -> Manifest {
    if known.from.is_some() {
        found.from = known.from;
    }
    if known.resolved.is_some() {
        found.resolved = known.resolved;
    }
    found
}

pub(crate) fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)
        .map_err(|e| CacheError::json(path.display().to_string(), &e))?;
    atomic_write(path, &bytes).with_path(path)
}
