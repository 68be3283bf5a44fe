//! Layered configuration and the typed [`CacheConfig`] handed to every
//! cache component.
//!
//! Layers are consulted in order; the first layer defining a key wins. The
//! usual stack is: command line, `npm_config_*` environment, project
//! `.npmrc` files, user `.npmrc`, built-in defaults.

pub mod npmrc;

use crate::error::{CacheError, Result};
use crate::range::parse_version_loose;
use semver::Version;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Prefix of environment variables read into the env layer.
pub const ENV_PREFIX: &str = "npm_config_";

/// A named set of raw string settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayer {
    name: String,
    values: HashMap<String, String>,
}

impl ConfigLayer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: HashMap::new(),
        }
    }

    /// Layer name (for diagnostics).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Read `npm_config_*` variables. `npm_config_cache_min` becomes `cache-min`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Self {
        let mut layer = Self::new("env");
        for (key, value) in vars {
            if key.len() <= ENV_PREFIX.len()
                || !key[..ENV_PREFIX.len()].eq_ignore_ascii_case(ENV_PREFIX)
            {
                continue;
            }
            let name = key[ENV_PREFIX.len()..].to_ascii_lowercase();
            // Keys starting with an underscore keep it
            let name = match name.strip_prefix('_') {
                Some("authtoken") => "_authToken".to_string(),
                Some(rest) => format!("_{}", rest.replace('_', "-")),
                None => name.replace('_', "-"),
            };
            layer.set(name, value);
        }
        layer
    }

    /// Built-in defaults.
    #[must_use]
    pub fn defaults() -> Self {
        Self::new("default")
            .with("cache", default_cache_root().to_string_lossy())
            .with("registry", DEFAULT_REGISTRY)
            .with("tag", "latest")
            .with("force", "false")
            .with("cache-min", "10")
            .with("cache-max", "Infinity")
            .with("fetch-retries", "2")
            .with("fetch-retry-factor", "10")
            .with("fetch-retry-mintimeout", "10000")
            .with("fetch-retry-maxtimeout", "60000")
            .with("cache-lock-stale", "60000")
            .with("cache-lock-retries", "10")
            .with("cache-lock-wait", "10000")
            .with("git", "git")
            .with("strict-ssl", "true")
    }
}

/// Ordered configuration layers, highest priority first.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    layers: Vec<ConfigLayer>,
}

impl ConfigLayers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard stack for a working directory: `cli`, env, `.npmrc` files, defaults.
    #[must_use]
    pub fn load(cwd: &Path, cli: ConfigLayer) -> Self {
        let mut layers = Self::new();
        layers.push(cli);
        layers.push(ConfigLayer::from_env());
        for layer in npmrc::load_npmrc_layers(cwd) {
            layers.push(layer);
        }
        layers.push(ConfigLayer::defaults());
        layers
    }

    /// Append a layer below every existing one.
    pub fn push(&mut self, layer: ConfigLayer) {
        self.layers.push(layer);
    }

    /// Look up `key`, highest priority first.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }

    /// Look up `key` and report which layer supplied it.
    #[must_use]
    pub fn resolve_with_source(&self, key: &str) -> Option<(&str, &str)> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(key).map(|v| (v, layer.name())))
    }

    /// All keys across layers starting with `prefix`, each resolved once.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for layer in &self.layers {
            for key in layer.keys() {
                if key.starts_with(prefix) && !out.iter().any(|(k, _)| k == key) {
                    if let Some(value) = self.resolve(key) {
                        out.push((key.to_string(), value.to_string()));
                    }
                }
            }
        }
        out
    }
}

/// Retry schedule for tarball downloads.
///
/// The delay before retry `n` (0-based) is
/// `min(min_timeout * factor^n, max_timeout)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            factor: 10.0,
            min_timeout: Duration::from_millis(10_000),
            max_timeout: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry with 0-based index `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.min_timeout.as_secs_f64() * self.factor.powf(f64::from(attempt));
        let capped = scaled.min(self.max_timeout.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Advisory lock tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Age after which an existing lock file is considered abandoned.
    pub stale: Duration,
    /// Number of additional acquisition attempts.
    pub retries: u32,
    /// How long each attempt waits for the holder to release.
    pub wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale: Duration::from_millis(60_000),
            retries: 10,
            wait: Duration::from_millis(10_000),
        }
    }
}

/// Credentials attached to registry requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `Authorization: Basic <already base64-encoded user:pass>`
    Basic(String),
}

impl Auth {
    /// Value for the `Authorization` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self {
            Self::Bearer(token) => format!("Bearer {token}"),
            Self::Basic(encoded) => format!("Basic {encoded}"),
        }
    }
}

/// Explicit configuration passed to every cache/fetch component.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root of the on-disk cache.
    pub cache_root: PathBuf,
    /// Scratch space for downloads, unpacking and git checkouts.
    pub tmp_root: PathBuf,
    /// Default registry (always ends with `/`).
    pub registry: Url,
    /// Registries for `@scope` names.
    pub scoped_registries: HashMap<String, Url>,
    /// Default dist-tag.
    pub tag: String,
    /// Bypass cache freshness and shasum requirements.
    pub force: bool,
    /// Metadata younger than this is served without a request.
    pub cache_min: Duration,
    /// Upper bound for metadata freshness; `None` means unbounded.
    pub cache_max: Option<Duration>,
    pub retry: RetryPolicy,
    pub lock: LockConfig,
    /// git binary name or path.
    pub git: String,
    pub strict_ssl: bool,
    pub proxy: Option<String>,
    pub https_proxy: Option<String>,
    /// Credentials for the default registry.
    pub auth: Option<Auth>,
    /// `//host/path` → token, from `//host/:_authToken=` settings.
    pub host_tokens: HashMap<String, String>,
    /// Running node version used by the engine filter. [`load`] fills it
    /// from `node --version` when not configured.
    pub node_version: Option<Version>,
    /// Running npm version used by the engine filter; defaults to
    /// [`NPM_COMPAT_VERSION`](crate::version::NPM_COMPAT_VERSION).
    pub npm_version: Option<Version>,
    pub user_agent: String,
}

impl CacheConfig {
    /// Defaults with the given cache root.
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let cache_root = cache_root.into();
        Self {
            tmp_root: default_tmp_root(),
            cache_root,
            registry: Url::parse(DEFAULT_REGISTRY).expect("default registry URL is valid"),
            scoped_registries: HashMap::new(),
            tag: "latest".to_string(),
            force: false,
            cache_min: Duration::from_secs(10),
            cache_max: None,
            retry: RetryPolicy::default(),
            lock: LockConfig::default(),
            git: "git".to_string(),
            strict_ssl: true,
            proxy: None,
            https_proxy: None,
            auth: None,
            host_tokens: HashMap::new(),
            node_version: None,
            npm_version: Version::parse(crate::version::NPM_COMPAT_VERSION).ok(),
            user_agent: crate::version::user_agent(),
        }
    }

    /// Set the registry URL (a trailing slash is added when missing).
    ///
    /// # Errors
    /// Returns an error if the URL is invalid.
    pub fn with_registry(mut self, registry: &str) -> Result<Self> {
        self.registry = parse_registry_url("registry", registry)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_tmp_root(mut self, tmp_root: impl Into<PathBuf>) -> Self {
        self.tmp_root = tmp_root.into();
        self
    }

    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, cache_min: Duration, cache_max: Option<Duration>) -> Self {
        self.cache_min = cache_min;
        self.cache_max = cache_max;
        self
    }

    #[must_use]
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Build a typed config from layered raw settings.
    ///
    /// # Errors
    /// Returns [`CacheError::Config`] for unparseable values.
    pub fn from_layers(layers: &ConfigLayers) -> Result<Self> {
        let cache_root = layers
            .resolve("cache")
            .map_or_else(default_cache_root, PathBuf::from);
        let mut config = Self::new(cache_root);

        if let Some(tmp) = layers.resolve("tmp") {
            config.tmp_root = PathBuf::from(tmp).join(format!("pkgcache-{}", std::process::id()));
        }
        if let Some(registry) = layers.resolve("registry") {
            config.registry = parse_registry_url("registry", registry)?;
        }
        if let Some(tag) = layers.resolve("tag") {
            config.tag = tag.to_string();
        }
        config.force = bool_setting(layers, "force")?.unwrap_or(false);
        config.strict_ssl = bool_setting(layers, "strict-ssl")?.unwrap_or(true);

        if let Some(secs) = seconds_setting(layers, "cache-min")? {
            config.cache_min = secs.unwrap_or(Duration::ZERO);
        }
        if let Some(secs) = seconds_setting(layers, "cache-max")? {
            config.cache_max = secs;
        }

        if let Some(n) = number_setting(layers, "fetch-retries")? {
            config.retry.retries = n as u32;
        }
        if let Some(n) = number_setting(layers, "fetch-retry-factor")? {
            config.retry.factor = n;
        }
        if let Some(ms) = millis_setting(layers, "fetch-retry-mintimeout")? {
            config.retry.min_timeout = ms;
        }
        if let Some(ms) = millis_setting(layers, "fetch-retry-maxtimeout")? {
            config.retry.max_timeout = ms;
        }
        if let Some(ms) = millis_setting(layers, "cache-lock-stale")? {
            config.lock.stale = ms;
        }
        if let Some(n) = number_setting(layers, "cache-lock-retries")? {
            config.lock.retries = n as u32;
        }
        if let Some(ms) = millis_setting(layers, "cache-lock-wait")? {
            config.lock.wait = ms;
        }

        if let Some(git) = layers.resolve("git") {
            config.git = git.to_string();
        }
        config.proxy = non_empty(layers.resolve("proxy"));
        config.https_proxy = non_empty(layers.resolve("https-proxy"));
        if let Some(ua) = non_empty(layers.resolve("user-agent")) {
            config.user_agent = ua;
        }

        if let Some(token) = non_empty(layers.resolve("_authToken")) {
            config.auth = Some(Auth::Bearer(token));
        } else if let Some(basic) = non_empty(layers.resolve("_auth")) {
            config.auth = Some(Auth::Basic(basic));
        }

        if let Some(node) = version_setting(layers, "node-version")? {
            config.node_version = Some(node);
        }
        if let Some(npm) = version_setting(layers, "npm-version")? {
            config.npm_version = Some(npm);
        }

        for (key, value) in layers.keys_with_prefix("//") {
            if let Some(host) = key.strip_suffix(":_authToken") {
                let host = host.trim_start_matches('/').trim_end_matches('/');
                config.host_tokens.insert(host.to_string(), value);
            }
        }
        for (key, value) in layers.keys_with_prefix("@") {
            if let Some(scope) = key.strip_suffix(":registry") {
                let url = parse_registry_url(&key, &value)?;
                config.scoped_registries.insert(scope.to_string(), url);
            }
        }

        Ok(config)
    }

    /// Registry responsible for package `name` (scope-aware).
    #[must_use]
    pub fn registry_for(&self, name: &str) -> &Url {
        if name.starts_with('@') {
            if let Some((scope, _)) = name.split_once('/') {
                if let Some(url) = self.scoped_registries.get(scope) {
                    return url;
                }
            }
        }
        &self.registry
    }

    /// Credentials to send with a request to `url`.
    ///
    /// Host-scoped tokens match on `host/path` prefixes; the default
    /// credentials are only sent to the default registry's host.
    #[must_use]
    pub fn auth_for(&self, url: &Url) -> Option<Auth> {
        let host = url.host_str()?;
        let path = url.path().trim_end_matches('/');
        let target = format!("{host}{path}");

        let best = self
            .host_tokens
            .iter()
            .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some((_, token)) = best {
            return Some(Auth::Bearer(token.clone()));
        }

        if self.registry.host_str() == Some(host) {
            return self.auth.clone();
        }
        None
    }
}

/// Default cache root: `~/.npm` on POSIX, `%LocalAppData%/npm-cache` on Windows.
#[must_use]
pub fn default_cache_root() -> PathBuf {
    if cfg!(windows) {
        dirs_next::data_local_dir().map_or_else(
            || PathBuf::from("npm-cache"),
            |p| p.join("npm-cache"),
        )
    } else {
        dirs_next::home_dir().map_or_else(|| PathBuf::from(".npm"), |p| p.join(".npm"))
    }
}

fn default_tmp_root() -> PathBuf {
    std::env::temp_dir().join(format!("pkgcache-{}", std::process::id()))
}

fn parse_registry_url(key: &str, value: &str) -> Result<Url> {
    let with_slash = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    };
    Url::parse(&with_slash).map_err(|e| CacheError::Config {
        key: key.to_string(),
        message: format!("'{value}' is not a URL: {e}"),
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn config_error(key: &str, value: &str, expected: &str) -> CacheError {
    CacheError::Config {
        key: key.to_string(),
        message: format!("expected {expected}, got '{value}'"),
    }
}

fn bool_setting(layers: &ConfigLayers, key: &str) -> Result<Option<bool>> {
    match layers.resolve(key) {
        None => Ok(None),
        Some("true" | "1" | "") => Ok(Some(true)),
        Some("false" | "0") => Ok(Some(false)),
        Some(other) => Err(config_error(key, other, "a boolean")),
    }
}

fn number_setting(layers: &ConfigLayers, key: &str) -> Result<Option<f64>> {
    match layers.resolve(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| *n >= 0.0)
            .map(Some)
            .ok_or_else(|| config_error(key, raw, "a non-negative number")),
    }
}

fn millis_setting(layers: &ConfigLayers, key: &str) -> Result<Option<Duration>> {
    Ok(number_setting(layers, key)?.map(|ms| Duration::from_secs_f64(ms / 1000.0)))
}

/// Seconds, where `Infinity` maps to `None` (unbounded).
fn seconds_setting(layers: &ConfigLayers, key: &str) -> Result<Option<Option<Duration>>> {
    match layers.resolve(key) {
        None => Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case("infinity") => Ok(Some(None)),
        Some(_) => Ok(number_setting(layers, key)?.map(|s| {
            if s.is_finite() {
                Some(Duration::from_secs_f64(s))
            } else {
                None
            }
        })),
    }
}

fn version_setting(layers: &ConfigLayers, key: &str) -> Result<Option<Version>> {
    match non_empty(layers.resolve(key)) {
        None => Ok(None),
        Some(raw) => Version::parse(raw.trim_start_matches('v'))
            .map(Some)
            .map_err(|_| config_error(key, &raw, "a semver version")),
    }
}

/// Resolve the standard layer stack for `cwd` into a [`CacheConfig`].
///
/// # Errors
/// Returns an error if a setting is invalid.
pub fn load(cwd: &Path, cli: ConfigLayer) -> Result<CacheConfig> {
    let mut config = CacheConfig::from_layers(&ConfigLayers::load(cwd, cli))?;
    if config.node_version.is_none() {
        config.node_version = detect_node_version();
        debug!(node = ?config.node_version, "detected node version");
    }
    Ok(config)
}

/// Version printed by `node --version` for the `node` on `PATH`.
#[must_use]
pub fn detect_node_version() -> Option<Version> {
    let node = which::which("node").ok()?;
    let output = std::process::Command::new(node)
        .arg("--version")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_version_loose(String::from_utf8_lossy(&output.stdout).trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(cli: ConfigLayer) -> ConfigLayers {
        let mut layers = ConfigLayers::new();
        layers.push(cli);
        layers.push(ConfigLayer::defaults());
        layers
    }

    #[test]
    fn test_first_layer_wins() {
        let mut stack = ConfigLayers::new();
        stack.push(ConfigLayer::new("cli").with("tag", "next"));
        stack.push(ConfigLayer::new("user").with("tag", "beta").with("force", "true"));

        assert_eq!(stack.resolve("tag"), Some("next"));
        assert_eq!(stack.resolve("force"), Some("true"));
        assert_eq!(stack.resolve_with_source("force"), Some(("true", "user")));
        assert_eq!(stack.resolve("missing"), None);
    }

    #[test]
    fn test_env_layer_key_mapping() {
        let vars = vec![
            ("npm_config_cache_min".to_string(), "99".to_string()),
            ("NPM_CONFIG_REGISTRY".to_string(), "http://r/".to_string()),
            ("npm_config__authToken".to_string(), "tok".to_string()),
            ("HOME".to_string(), "/home/x".to_string()),
        ];
        let layer = ConfigLayer::from_vars(vars.into_iter());
        assert_eq!(layer.get("cache-min"), Some("99"));
        assert_eq!(layer.get("registry"), Some("http://r/"));
        assert_eq!(layer.get("_authToken"), Some("tok"));
        assert_eq!(layer.len(), 3);
    }

    #[test]
    fn test_defaults_produce_default_config() {
        let config = CacheConfig::from_layers(&layers(ConfigLayer::new("cli"))).unwrap();
        assert_eq!(config.registry.as_str(), DEFAULT_REGISTRY);
        assert_eq!(config.tag, "latest");
        assert!(!config.force);
        assert_eq!(config.cache_min, Duration::from_secs(10));
        assert_eq!(config.cache_max, None);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.lock, LockConfig::default());
        assert!(config.strict_ssl);
        assert_eq!(
            config.npm_version,
            Some(Version::parse(crate::version::NPM_COMPAT_VERSION).unwrap())
        );
        assert_eq!(config.node_version, None);
    }

    #[test]
    fn test_npm_version_override() {
        let cli = ConfigLayer::new("cli").with("npm-version", "10.2.0");
        let config = CacheConfig::from_layers(&layers(cli)).unwrap();
        assert_eq!(config.npm_version, Some(Version::new(10, 2, 0)));
    }

    #[test]
    fn test_typed_overrides() {
        let cli = ConfigLayer::new("cli")
            .with("registry", "http://localhost:4873")
            .with("cache-min", "0")
            .with("cache-max", "300")
            .with("fetch-retries", "5")
            .with("fetch-retry-mintimeout", "250")
            .with("cache-lock-wait", "50")
            .with("force", "true")
            .with("node-version", "v18.17.0");
        let config = CacheConfig::from_layers(&layers(cli)).unwrap();

        assert_eq!(config.registry.as_str(), "http://localhost:4873/");
        assert_eq!(config.cache_min, Duration::ZERO);
        assert_eq!(config.cache_max, Some(Duration::from_secs(300)));
        assert_eq!(config.retry.retries, 5);
        assert_eq!(config.retry.min_timeout, Duration::from_millis(250));
        assert_eq!(config.lock.wait, Duration::from_millis(50));
        assert!(config.force);
        assert_eq!(config.node_version, Some(Version::new(18, 17, 0)));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let cli = ConfigLayer::new("cli").with("fetch-retries", "lots");
        let err = CacheConfig::from_layers(&layers(cli)).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::ECONFIG);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(60));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
    }

    #[test]
    fn test_scoped_registry_and_host_tokens() {
        let cli = ConfigLayer::new("cli")
            .with("@acme:registry", "https://npm.acme.dev")
            .with("//npm.acme.dev/:_authToken", "acme-token")
            .with("_authToken", "default-token");
        let config = CacheConfig::from_layers(&layers(cli)).unwrap();

        assert_eq!(
            config.registry_for("@acme/widget").as_str(),
            "https://npm.acme.dev/"
        );
        assert_eq!(config.registry_for("left-pad").as_str(), DEFAULT_REGISTRY);

        let acme = Url::parse("https://npm.acme.dev/@acme%2fwidget").unwrap();
        assert_eq!(
            config.auth_for(&acme),
            Some(Auth::Bearer("acme-token".into()))
        );

        let default = Url::parse("https://registry.npmjs.org/left-pad").unwrap();
        assert_eq!(
            config.auth_for(&default),
            Some(Auth::Bearer("default-token".into()))
        );

        let elsewhere = Url::parse("https://cdn.example.com/x.tgz").unwrap();
        assert_eq!(config.auth_for(&elsewhere), None);
    }
}
