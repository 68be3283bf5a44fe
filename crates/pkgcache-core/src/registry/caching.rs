//! Registry client with an on-disk metadata cache.
//!
//! Every GET is mirrored to a `.cache.json` sidecar under the cache root.
//! Reads within the freshness window never touch the network; older entries
//! are revalidated with `If-None-Match`, and a registry outage falls back to
//! whatever copy is on disk.

use super::client::{RegistryClient, RegistryResponse, RequestOptions};
use crate::cache_dir::CacheDir;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::inflight::Inflight;
use crate::paths::{cache_dir_for_uri, cache_file};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pkgcache_util::fs::atomic_write;
use reqwest::Method;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

const ETAG_FIELD: &str = "_etag";
const WRITE_SUFFIX: &str = "?write=true";

/// Options for [`CachingClient::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Serve stale data immediately and refresh in the background.
    pub stale_ok: bool,
    /// Requested freshness window; clamped into `[cache_min, cache_max]`.
    pub timeout: Option<Duration>,
}

/// Where a [`CachedResponse`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Sidecar within the freshness window; no request made.
    Fresh,
    /// Stale sidecar served under `stale_ok`; a refresh was started.
    Stale,
    /// Registry answered `304`; sidecar data reused.
    Revalidated,
    /// Registry sent a new document.
    Network,
    /// Registry unreachable; sidecar data reused.
    Fallback,
}

/// A metadata document and how it was obtained.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// `304` for anything served from disk, otherwise the registry's status.
    pub status: u16,
    /// Document without the `_etag` bookkeeping field.
    pub data: Value,
    pub raw: Bytes,
    pub etag: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub source: ResponseSource,
}

impl CachedResponse {
    fn from_disk(data: Value, source: ResponseSource) -> Self {
        let (data, etag) = strip_etag(data);
        let raw = Bytes::from(serde_json::to_vec(&data).unwrap_or_default());
        Self {
            status: 304,
            data,
            raw,
            etag,
            date: None,
            source,
        }
    }
}

struct Inner {
    client: RegistryClient,
    config: Arc<CacheConfig>,
    cache_dir: Arc<CacheDir>,
    inflight: Inflight<CachedResponse>,
}

/// Caching registry client. Cheap to clone.
#[derive(Clone)]
pub struct CachingClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CachingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingClient")
            .field("cache_root", &self.inner.config.cache_root)
            .finish_non_exhaustive()
    }
}

impl CachingClient {
    #[must_use]
    pub fn new(client: RegistryClient, config: Arc<CacheConfig>, cache_dir: Arc<CacheDir>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                cache_dir,
                inflight: Inflight::new(),
            }),
        }
    }

    #[must_use]
    pub fn client(&self) -> &RegistryClient {
        &self.inner.client
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Arc<CacheDir> {
        &self.inner.cache_dir
    }

    /// Sidecar path for `uri`.
    ///
    /// # Errors
    /// Returns an error for URIs without a host.
    pub fn sidecar_path(&self, uri: &str) -> Result<PathBuf> {
        cache_file(&self.inner.config.cache_root, uri)
    }

    /// Freshness window for a request.
    #[must_use]
    pub fn ttl(&self, timeout: Option<Duration>) -> Duration {
        let config = &self.inner.config;
        let ttl = timeout.unwrap_or(Duration::ZERO).max(config.cache_min);
        match config.cache_max {
            Some(max) => ttl.min(max),
            None => ttl,
        }
    }

    /// Fetch a registry document, from the sidecar cache when possible.
    ///
    /// # Errors
    /// HTTP and transport errors when no usable cached copy exists.
    pub async fn get(&self, uri: &str, options: GetOptions) -> Result<CachedResponse> {
        let sidecar = self.sidecar_path(uri)?;

        if uri.ends_with(WRITE_SUFFIX) {
            trace!(uri = %uri, "read-after-write, skipping cache");
            return self.fetch_deduped(uri, sidecar, None).await;
        }

        let cached = read_sidecar(&sidecar);
        if let Some((data, age)) = &cached {
            let ttl = self.ttl(options.timeout);
            if *age < ttl {
                debug!(uri = %uri, age_ms = age.as_millis() as u64, "not expired, no request");
                return Ok(CachedResponse::from_disk(data.clone(), ResponseSource::Fresh));
            }

            if options.stale_ok {
                debug!(uri = %uri, "serving stale data, refreshing in background");
                let this = self.clone();
                let uri_owned = uri.to_string();
                let background = cached.clone().map(|(d, _)| d);
                tokio::spawn(async move {
                    if let Err(e) = this.fetch_deduped(&uri_owned, sidecar, background).await {
                        debug!(uri = %uri_owned, error = %e, "background refresh failed");
                    }
                });
                return Ok(CachedResponse::from_disk(data.clone(), ResponseSource::Stale));
            }
        }

        self.fetch_deduped(uri, sidecar, cached.map(|(d, _)| d)).await
    }

    async fn fetch_deduped(
        &self,
        uri: &str,
        sidecar: PathBuf,
        cached: Option<Value>,
    ) -> Result<CachedResponse> {
        let key = format!("registry:{uri}");
        self.inner
            .inflight
            .run(&key, || self.fetch_and_save(uri, sidecar, cached))
            .await
    }

    async fn fetch_and_save(
        &self,
        uri: &str,
        sidecar: PathBuf,
        cached: Option<Value>,
    ) -> Result<CachedResponse> {
        let etag = cached
            .as_ref()
            .and_then(|d| d.get(ETAG_FIELD))
            .and_then(Value::as_str)
            .map(str::to_string);

        let result = self
            .inner
            .client
            .request(
                Method::GET,
                uri,
                RequestOptions {
                    etag,
                    body: None,
                },
            )
            .await;

        match result {
            Ok(response) if response.status == 304 => match cached {
                Some(data) => {
                    debug!(uri = %uri, "304, reusing cached data");
                    // Rewriting renews the sidecar mtime
                    self.save(&sidecar, &data).await;
                    let mut out = CachedResponse::from_disk(data, ResponseSource::Revalidated);
                    out.date = response.date;
                    Ok(out)
                }
                None => Err(CacheError::Http {
                    uri: uri.to_string(),
                    status: 304,
                    message: "not modified, but nothing cached".into(),
                }),
            },
            Ok(response) => Ok(self.store(uri, &sidecar, response).await),
            Err(e) if e.is_retryable() => match cached.filter(is_usable) {
                Some(data) => {
                    warn!(uri = %uri, error = %e, "registry unreachable, using cached data");
                    Ok(CachedResponse::from_disk(data, ResponseSource::Fallback))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn store(&self, uri: &str, sidecar: &Path, response: RegistryResponse) -> CachedResponse {
        let data = response.data.unwrap_or(Value::Null);
        if data.is_object() {
            let mut to_save = data.clone();
            if let (Some(etag), Some(obj)) = (&response.etag, to_save.as_object_mut()) {
                obj.insert(ETAG_FIELD.to_string(), Value::String(etag.clone()));
            }
            self.save(sidecar, &to_save).await;
        } else {
            trace!(uri = %uri, "non-object response, not cached");
        }

        let (data, _) = strip_etag(data);
        CachedResponse {
            status: response.status,
            data,
            raw: response.raw,
            etag: response.etag,
            date: response.date,
            source: ResponseSource::Network,
        }
    }

    /// Write a sidecar; failures are logged and ignored.
    pub(crate) async fn save(&self, sidecar: &Path, data: &Value) {
        if let Err(e) = self.try_save(sidecar, data).await {
            warn!(path = %sidecar.display(), error = %e, "failed to save cache entry");
        }
    }

    async fn try_save(&self, sidecar: &Path, data: &Value) -> Result<()> {
        let Some(parent) = sidecar.parent() else {
            return Ok(());
        };
        let stat = self.inner.cache_dir.make_dir(parent).await?;
        let bytes = serde_json::to_vec(data).map_err(|e| CacheError::json("cache entry", &e))?;
        atomic_write(sidecar, &bytes).map_err(|e| CacheError::io(sidecar, e))?;
        self.inner.cache_dir.fix_owner(sidecar, stat)?;
        trace!(path = %sidecar.display(), "saved cache entry");
        Ok(())
    }

    /// Send a mutating request and drop the cached copies under `uri`.
    ///
    /// # Errors
    /// HTTP and transport errors.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Result<RegistryResponse> {
        let is_write = method != Method::GET && method != Method::HEAD;
        let response = self
            .inner
            .client
            .request(method, uri, RequestOptions { etag: None, body })
            .await?;

        if is_write {
            self.invalidate(uri);
        }
        Ok(response)
    }

    /// Remove every cached document at or below `uri`.
    pub fn invalidate(&self, uri: &str) {
        let Ok(dir) = cache_dir_for_uri(&self.inner.config.cache_root, uri) else {
            return;
        };
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(uri = %uri, "invalidated cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "failed to invalidate cache"),
        }
    }
}

/// Read a sidecar and its age. Corrupt or unreadable files count as absent.
pub(crate) fn read_sidecar(path: &Path) -> Option<(Value, Duration)> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let bytes = std::fs::read(path).ok()?;
    let data: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "corrupt cache entry, ignoring");
            return None;
        }
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Some((data, age))
}

fn strip_etag(mut data: Value) -> (Value, Option<String>) {
    let etag = data
        .as_object_mut()
        .and_then(|obj| obj.remove(ETAG_FIELD))
        .and_then(|v| v.as_str().map(str::to_string));
    (data, etag)
}

/// Cached error documents are never served in place of a live answer.
fn is_usable(data: &Value) -> bool {
    data.is_object() && data.get("error").is_none()
}
