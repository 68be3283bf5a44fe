//! Mirrored git remotes under `{cache}/_git-remotes`.
//!
//! Each repository gets one bare `--mirror` clone. A request syncs the
//! mirror, resolves the treeish to a commit, checks that commit out into a
//! scratch directory and packs it like any other local directory.

use super::GitUrl;
use crate::error::{IoResultExt, Result};
use crate::paths::{git_remotes_dir, manifest_path};
use crate::registry::Manifest;
use crate::service::CacheService;
use crate::store::write_manifest;
use std::path::Path;
use tracing::{debug, info, warn};

const TEMPLATES_DIR: &str = "_templates";

impl CacheService {
    /// Cache the package at a git URL, pinned to the commit its treeish
    /// resolves to.
    ///
    /// Concurrent requests for the same repository and treeish share one
    /// sync; different treeishes of one repository serialize on the mirror.
    ///
    /// # Errors
    /// [`CacheError::NoGit`](crate::CacheError::NoGit) when git is missing,
    /// [`CacheError::Git`](crate::CacheError::Git) when a git command fails,
    /// and packing errors from the checkout.
    pub async fn add_remote_git(&self, url: &str) -> Result<Manifest> {
        let url = GitUrl::parse(url)?;
        let key = format!("{}#{}", url.repo_id(), url.treeish);
        self.inner()
            .git_remotes
            .run(&key, || self.fetch_git(&url))
            .await
    }

    async fn fetch_git(&self, url: &GitUrl) -> Result<Manifest> {
        self.git().resolve_binary()?;

        let remotes = git_remotes_dir(&self.config().cache_root);
        let mirror = remotes.join(url.repo_id());
        let templates = remotes.join(TEMPLATES_DIR);
        let stat = self.cache_dir().make_dir(&templates).await?;

        let lock = self.locker().lock(&mirror.display().to_string()).await?;
        self.sync_mirror(url, &mirror, &templates).await?;
        self.cache_dir().fix_owner(&mirror, stat)?;

        let mirror_str = mirror.to_string_lossy();
        let commit = self
            .git()
            .run(&["rev-list", "-n1", &url.treeish, "--"], Some(&mirror))
            .await?;
        debug!(url = %url.clone_url, treeish = %url.treeish, commit = %commit, "resolved treeish");

        let tmp_root = &self.config().tmp_root;
        std::fs::create_dir_all(tmp_root).with_path(tmp_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("git-")
            .tempdir_in(tmp_root)
            .with_path(tmp_root)?;
        let checkout = scratch.path().join("package");
        let checkout_str = checkout.to_string_lossy();
        let template_arg = format!("--template={}", templates.display());

        self.git()
            .run(&["clone", &template_arg, "--", &mirror_str, &checkout_str], None)
            .await?;
        lock.release();
        self.git()
            .run(&["checkout", "--quiet", &commit], Some(&checkout))
            .await?;

        let mut manifest = self
            .add_local_directory(&checkout, None, None, Some(url.resolved(&commit)))
            .await?;
        manifest.from = Some(url.original.clone());
        write_manifest(
            &manifest_path(&self.config().cache_root, &manifest.name, &manifest.version)?,
            &manifest,
        )?;
        info!(id = %manifest.spec_id(), commit = %commit, "cached git dependency");
        Ok(manifest)
    }

    /// Bring the mirror for `url` up to date, creating or replacing it as
    /// needed.
    async fn sync_mirror(&self, url: &GitUrl, mirror: &Path, templates: &Path) -> Result<()> {
        if !mirror.exists() {
            self.mirror_remote(url, mirror, templates).await?;
        } else {
            let origin = self
                .git()
                .run(&["config", "--get", "remote.origin.url"], Some(mirror))
                .await;
            match origin {
                Ok(origin) if origin == url.clone_url => {}
                Ok(origin) => {
                    warn!(mirror = %mirror.display(), expected = %url.clone_url, found = %origin, "origin changed, resetting mirror");
                    self.reset_remote(url, mirror, templates).await?;
                }
                Err(e) => {
                    warn!(mirror = %mirror.display(), error = %e, "unreadable mirror, resetting");
                    self.reset_remote(url, mirror, templates).await?;
                }
            }
        }

        debug!(mirror = %mirror.display(), "fetching");
        self.git()
            .run(&["fetch", "-a", "origin"], Some(mirror))
            .await?;
        Ok(())
    }

    async fn mirror_remote(&self, url: &GitUrl, mirror: &Path, templates: &Path) -> Result<()> {
        info!(url = %url.clone_url, mirror = %mirror.display(), "mirroring remote");
        if let Some(parent) = mirror.parent() {
            self.cache_dir().make_dir(parent).await?;
        }
        let template_arg = format!("--template={}", templates.display());
        let mirror_str = mirror.to_string_lossy();
        self.git()
            .run(
                &["clone", &template_arg, "--mirror", "--", &url.clone_url, &mirror_str],
                None,
            )
            .await?;
        Ok(())
    }

    async fn reset_remote(&self, url: &GitUrl, mirror: &Path, templates: &Path) -> Result<()> {
        std::fs::remove_dir_all(mirror).with_path(mirror)?;
        self.mirror_remote(url, mirror, templates).await
    }
}
