//! In-process mock npm registry for integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use pkgcache_core::config::RetryPolicy;
use pkgcache_core::{CacheConfig, CacheService};
use pkgcache_util::hash::sha1_bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tar::Builder;

#[derive(Default)]
struct Registry {
    /// Request path (percent-encoded, as sent) to body.
    documents: Mutex<HashMap<String, Vec<u8>>>,
    hits: Mutex<HashMap<String, usize>>,
    /// Path to (status, remaining count).
    failures: Mutex<HashMap<String, (u16, usize)>>,
    /// Artificial latency for every response.
    delay: Mutex<Duration>,
}

/// A mock registry listening on an ephemeral port.
#[derive(Clone)]
pub struct MockRegistry {
    pub base: String,
    state: Arc<Registry>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let state = Arc::new(Registry::default());
        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}/"),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/'))
    }

    pub fn set_json(&self, path: &str, doc: &Value) {
        self.set_raw(path, serde_json::to_vec(doc).unwrap());
    }

    pub fn set_raw(&self, path: &str, body: Vec<u8>) {
        self.state
            .documents
            .lock()
            .unwrap()
            .insert(normalize(path), body);
    }

    pub fn json(&self, path: &str) -> Value {
        let docs = self.state.documents.lock().unwrap();
        docs.get(&normalize(path))
            .map(|b| serde_json::from_slice(b).unwrap())
            .unwrap_or(Value::Null)
    }

    /// Publish `name@version` with a generated tarball. The first published
    /// version becomes `latest`. Returns the tarball shasum.
    pub fn publish(&self, name: &str, version: &str) -> String {
        let tgz = tarball(name, version);
        let shasum = sha1_bytes(&tgz);
        self.publish_with(name, version, tgz, Some(&shasum));
        shasum
    }

    /// Publish with explicit bytes and declared shasum.
    pub fn publish_with(&self, name: &str, version: &str, tgz: Vec<u8>, shasum: Option<&str>) {
        let encoded = name.replace('/', "%2f");
        let base_name = name.rsplit('/').next().unwrap_or(name);
        let tarball_path = format!("/{name}/-/{base_name}-{version}.tgz");
        self.set_raw(&tarball_path, tgz);

        let mut dist = json!({ "tarball": self.url(&tarball_path) });
        if let Some(shasum) = shasum {
            dist["shasum"] = json!(shasum);
        }

        let mut doc = self.json(&format!("/{encoded}"));
        if doc.is_null() {
            doc = json!({ "name": name, "dist-tags": {}, "versions": {} });
        }
        doc["versions"][version] = json!({
            "name": name,
            "version": version,
            "dist": dist,
        });
        if doc["dist-tags"].get("latest").is_none() {
            doc["dist-tags"]["latest"] = json!(version);
        }
        self.set_json(&format!("/{encoded}"), &doc);
    }

    pub fn set_tag(&self, name: &str, tag: &str, version: &str) {
        let path = format!("/{}", name.replace('/', "%2f"));
        let mut doc = self.json(&path);
        doc["dist-tags"][tag] = json!(version);
        self.set_json(&path, &doc);
    }

    /// Answer the next `times` requests for `path` with `status`.
    pub fn fail(&self, path: &str, status: u16, times: usize) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(normalize(path), (status, times));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(&normalize(path))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.state.hits.lock().unwrap().values().sum()
    }

    /// A service whose registry is this mock, with fast retries.
    pub fn service(&self, root: &Path) -> CacheService {
        CacheService::new(self.config(root)).unwrap()
    }

    pub fn config(&self, root: &Path) -> CacheConfig {
        CacheConfig::new(root)
            .with_registry(&self.base)
            .unwrap()
            .with_tmp_root(root.join(".tmp"))
            .with_retry(RetryPolicy {
                retries: 2,
                factor: 1.0,
                min_timeout: Duration::from_millis(10),
                max_timeout: Duration::from_millis(10),
            })
    }
}

/// Scoped names arrive as `%2f` or `%2F`; store them one way.
fn normalize(path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    path.replace("%2F", "%2f")
}

async fn handle(State(state): State<Arc<Registry>>, uri: Uri, headers: HeaderMap) -> Response {
    let key = match uri.query() {
        Some(q) => normalize(&format!("{}?{q}", uri.path())),
        None => normalize(uri.path()),
    };
    *state.hits.lock().unwrap().entry(key.clone()).or_default() += 1;

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    {
        let mut failures = state.failures.lock().unwrap();
        if let Some((status, remaining)) = failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                let status = StatusCode::from_u16(*status).unwrap();
                return (status, r#"{"error":"injected"}"#).into_response();
            }
        }
    }

    let body = state.documents.lock().unwrap().get(&key).cloned();
    let Some(body) = body else {
        return (StatusCode::NOT_FOUND, r#"{"error":"not_found"}"#).into_response();
    };

    let etag = format!("\"{}\"", sha1_bytes(&body));
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if if_none_match == Some(etag.as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let content_type = if key.ends_with(".tgz") {
        "application/octet-stream"
    } else {
        "application/json"
    };
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::ETAG, etag),
        ],
        Body::from(body),
    )
        .into_response()
}

/// A gzipped tarball with `package/package.json` for `name@version`.
pub fn tarball(name: &str, version: &str) -> Vec<u8> {
    let manifest = json!({ "name": name, "version": version });
    tarball_with(&[
        ("package/package.json", manifest.to_string().as_bytes()),
        ("package/index.js", b"module.exports = 1;\n"),
    ])
}

pub fn tarball_with(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
