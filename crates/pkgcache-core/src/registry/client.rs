//! Raw registry HTTP client.
//!
//! Sends requests with the configured user agent, auth and proxies, and maps
//! responses into [`RegistryResponse`] or [`CacheError`]. No caching happens
//! here; see [`super::caching`].

use crate::config::CacheConfig;
use crate::error::{CacheError, IoResultExt, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use pkgcache_util::hash::Sha1Stream;
use reqwest::header::{HeaderMap, AUTHORIZATION, DATE, ETAG, IF_NONE_MATCH};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use url::Url;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// A registry response.
#[derive(Debug, Clone)]
pub struct RegistryResponse {
    pub status: u16,
    pub etag: Option<String>,
    /// Parsed `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// Parsed body; `None` for `304` and empty bodies.
    pub data: Option<Value>,
    /// Body bytes as received.
    pub raw: Bytes,
}

/// Extra inputs for [`RegistryClient::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Sent as `If-None-Match`.
    pub etag: Option<String>,
    /// JSON request body.
    pub body: Option<Value>,
}

/// HTTP client for registry documents and tarballs.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    config: Arc<CacheConfig>,
}

impl RegistryClient {
    /// Build a client from the configuration.
    ///
    /// # Errors
    /// Returns an error if a proxy URL is invalid or the TLS backend fails.
    pub fn new(config: Arc<CacheConfig>) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(!config.strict_ssl);

        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy).map_err(|e| CacheError::Config {
                key: "proxy".into(),
                message: e.to_string(),
            })?);
        }
        if let Some(proxy) = config.https_proxy.as_ref().or(config.proxy.as_ref()) {
            builder = builder.proxy(reqwest::Proxy::https(proxy).map_err(|e| {
                CacheError::Config {
                    key: "https-proxy".into(),
                    message: e.to_string(),
                }
            })?);
        }

        let http = builder.build().map_err(|e| CacheError::Config {
            key: "registry".into(),
            message: format!("failed to create HTTP client: {e}"),
        })?;

        Ok(Self { http, config })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Send a request and decode the JSON response.
    ///
    /// A `304 Not Modified` is returned as a response without data.
    ///
    /// # Errors
    /// [`CacheError::Transport`] when no response arrives, [`CacheError::Http`]
    /// for statuses >= 400, [`CacheError::Json`] for undecodable bodies.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        options: RequestOptions,
    ) -> Result<RegistryResponse> {
        let url = parse_uri(uri)?;
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(auth) = self.config.auth_for(&url) {
            request = request.header(AUTHORIZATION, auth.header_value());
        }
        if let Some(etag) = &options.etag {
            trace!(uri = %uri, etag = %etag, "conditional request");
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        debug!(method = %method, uri = %uri, "request");
        let response = request.send().await.map_err(|e| transport(uri, &e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let raw = response.bytes().await.map_err(|e| transport(uri, &e))?;
        debug!(status = status.as_u16(), uri = %uri, "response");

        if status == StatusCode::NOT_MODIFIED {
            return Ok(RegistryResponse {
                status: status.as_u16(),
                etag: header_string(&headers, ETAG),
                date: parse_date(&headers),
                data: None,
                raw,
            });
        }

        let data = if raw.is_empty() {
            None
        } else {
            match serde_json::from_slice::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(e) if status.is_success() => return Err(CacheError::json(uri, &e)),
                Err(_) => None,
            }
        };

        if status.as_u16() >= 400 {
            return Err(http_error(uri, status, data.as_ref()));
        }

        Ok(RegistryResponse {
            status: status.as_u16(),
            etag: header_string(&headers, ETAG),
            date: parse_date(&headers),
            data,
            raw,
        })
    }

    /// Stream `url` into `dest`, returning the SHA-1 of the bytes written.
    ///
    /// `dest` is created or truncated; on error it may hold a partial body and
    /// the caller is responsible for discarding it.
    ///
    /// # Errors
    /// Transport, HTTP status and file errors.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<String> {
        let parsed = parse_uri(url)?;
        let mut request = self.http.get(parsed.clone());
        if let Some(auth) = self.config.auth_for(&parsed) {
            request = request.header(AUTHORIZATION, auth.header_value());
        }

        debug!(url = %url, "GET tarball");
        let response = request.send().await.map_err(|e| transport(url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_error(url, status, None));
        }

        let mut file = tokio::fs::File::create(dest).await.with_path(dest)?;
        let mut hasher = Sha1Stream::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport(url, &e))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.with_path(dest)?;
        }
        file.flush().await.with_path(dest)?;
        file.sync_all().await.with_path(dest)?;

        Ok(hasher.finish())
    }
}

fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| CacheError::BadUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

fn transport(uri: &str, err: &reqwest::Error) -> CacheError {
    CacheError::Transport {
        uri: uri.to_string(),
        message: err.to_string(),
    }
}

fn http_error(uri: &str, status: StatusCode, body: Option<&Value>) -> CacheError {
    let from_body = body.and_then(|b| {
        b.get("reason")
            .or_else(|| b.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    CacheError::Http {
        uri: uri.to_string(),
        status: status.as_u16(),
        message: from_body
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_date(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = header_string(headers, DATE)?;
    DateTime::parse_from_rfc2822(&raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
