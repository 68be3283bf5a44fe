//! Downloading tarballs into the cache.

use crate::error::{CacheError, IoResultExt, Result};
use crate::registry::Manifest;
use crate::service::CacheService;
use tracing::{debug, info, warn};

impl CacheService {
    /// Download `url`, verify it against `shasum` and add it to the cache.
    ///
    /// Concurrent calls for the same URL share one download. Transport
    /// failures, 408 and 5xx responses are retried with backoff; a shasum
    /// mismatch is not.
    ///
    /// # Errors
    /// [`CacheError::Integrity`] on shasum mismatch, otherwise the last
    /// download error.
    pub async fn add_remote_tarball(
        &self,
        url: &str,
        pkg: Option<Manifest>,
        shasum: Option<String>,
    ) -> Result<Manifest> {
        self.inner()
            .tarballs
            .run(url, || self.fetch_remote_tarball(url, pkg, shasum))
            .await
    }

    async fn fetch_remote_tarball(
        &self,
        url: &str,
        pkg: Option<Manifest>,
        shasum: Option<String>,
    ) -> Result<Manifest> {
        let tmp_root = &self.config().tmp_root;
        std::fs::create_dir_all(tmp_root).with_path(tmp_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("remote-")
            .tempdir_in(tmp_root)
            .with_path(tmp_root)?;
        let tmp = scratch.path().join("package.tgz");

        let actual = self.download_with_retry(url, &tmp).await?;
        if let Some(expected) = shasum.as_ref().filter(|s| **s != actual) {
            return Err(CacheError::Integrity {
                path: tmp,
                expected: expected.clone(),
                actual,
                from: url.to_string(),
            });
        }
        info!(url = %url, shasum = %actual, "fetched tarball");

        let mut pkg = pkg.unwrap_or_default();
        pkg.resolved = Some(url.to_string());
        if pkg.from.is_none() {
            pkg.from = Some(url.to_string());
        }

        let mut manifest = self
            .add_local_tarball_resolved(&tmp, Some(pkg), Some(actual.clone()), url)
            .await?;
        manifest.resolved = Some(url.to_string());
        manifest.shasum = Some(actual);
        Ok(manifest)
    }

    async fn download_with_retry(&self, url: &str, dest: &std::path::Path) -> Result<String> {
        let policy = self.config().retry;
        let mut attempt = 0;
        loop {
            match self.registry().client().download(url, dest).await {
                Ok(sum) => return Ok(sum),
                Err(e) if e.is_retryable() && attempt < policy.retries => {
                    let delay = policy.delay(attempt);
                    warn!(
                        url = %url,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "download failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "download failed");
                    return Err(e);
                }
            }
        }
    }
}
