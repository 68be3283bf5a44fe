//! On-disk cache layout.
//!
//! ```text
//! {cache}/{name}/{version}/package.tgz
//! {cache}/{name}/{version}/package/package.json
//! {cache}/{host}/{path...}/.cache.json
//! {cache}/_git-remotes/{repo_id}/
//! {cache}/_locks/{slug}-{sha1prefix}.lock
//! ```

use crate::error::{CacheError, Result};
use crate::range::parse_version_loose;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use url::Url;

/// Sidecar file name for cached registry documents.
pub const SIDECAR: &str = ".cache.json";
/// Directory holding bare git mirrors.
pub const GIT_REMOTES_DIR: &str = "_git-remotes";
/// Directory holding advisory lock files.
pub const LOCKS_DIR: &str = "_locks";
/// Canonical tarball file name inside a version directory.
pub const TARBALL_NAME: &str = "package.tgz";

/// Characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Directory for the cached copy of a registry URI.
///
/// The host (with `:` replaced by `_`) becomes the first component; each
/// path segment is URI-encoded with `%` replaced by `_`. A trailing
/// `/-rev/...` is ignored so document revisions share one entry.
///
/// # Errors
/// Returns an error if `uri` is not an absolute URL with a host.
pub fn cache_dir_for_uri(cache_root: &Path, uri: &str) -> Result<PathBuf> {
    let parsed = Url::parse(uri).map_err(|e| CacheError::BadUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    let Some(host) = parsed.host_str() else {
        return Err(CacheError::BadUri {
            uri: uri.to_string(),
            reason: "missing host".to_string(),
        });
    };

    let host = match parsed.port() {
        Some(port) => format!("{host}_{port}"),
        None => host.to_string(),
    };

    let path = parsed.path();
    let path = path.find("/-rev/").map_or(path, |idx| &path[..idx]);

    let mut dir = cache_root.join(host);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_encoding::percent_decode_str(segment).decode_utf8_lossy();
        let encoded = utf8_percent_encode(&decoded, URI_COMPONENT)
            .to_string()
            .replace('%', "_");
        dir.push(encoded);
    }
    Ok(dir)
}

/// Sidecar path for a registry URI.
///
/// # Errors
/// Returns an error if `uri` is not a valid URL.
pub fn cache_file(cache_root: &Path, uri: &str) -> Result<PathBuf> {
    Ok(cache_dir_for_uri(cache_root, uri)?.join(SIDECAR))
}

/// Reject names that cannot address a cache directory.
///
/// A name is one component, or `@scope/pkg`. Each component is non-empty,
/// does not start with `.` or `_`, and uses only URL-safe characters.
///
/// # Errors
/// [`CacheError::BadPackage`] naming the offending name.
pub fn check_package_name(name: &str) -> Result<()> {
    let parts = match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, pkg)) => vec![scope, pkg],
            None => return Err(bad_name(name, "scoped name is missing '/'")),
        },
        None => vec![name],
    };

    for part in parts {
        if part.is_empty() {
            return Err(bad_name(name, "empty name"));
        }
        if part.starts_with(['.', '_']) || part.contains("..") {
            return Err(bad_name(name, "name cannot start with '.' or '_' or contain '..'"));
        }
        if let Some(c) = part.chars().find(|c| !is_name_char(*c)) {
            return Err(bad_name(name, &format!("invalid character {c:?}")));
        }
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')')
}

fn bad_name(name: &str, reason: &str) -> CacheError {
    CacheError::bad_package(format!("invalid package name {name:?}: {reason}"))
}

/// Validate `name` and return the canonical form of `version`.
///
/// # Errors
/// [`CacheError::BadPackage`] when the name is unusable or the version is
/// not semver.
pub fn check_package_id(name: &str, version: &str) -> Result<String> {
    check_package_name(name)?;
    parse_version_loose(version)
        .map(|v| v.to_string())
        .ok_or_else(|| {
            CacheError::bad_package(format!("{name}: invalid version {version:?}"))
        })
}

/// `{cache}/{name}`; scoped names nest under their scope.
///
/// # Errors
/// See [`check_package_name`].
pub fn package_dir(cache_root: &Path, name: &str) -> Result<PathBuf> {
    check_package_name(name)?;
    let mut dir = cache_root.to_path_buf();
    for part in name.split('/') {
        dir.push(part);
    }
    Ok(dir)
}

/// `{cache}/{name}/{version}`, with `version` in canonical form.
///
/// # Errors
/// See [`check_package_id`].
pub fn package_root(cache_root: &Path, name: &str, version: &str) -> Result<PathBuf> {
    let version = check_package_id(name, version)?;
    Ok(package_dir(cache_root, name)?.join(version))
}

/// `{cache}/{name}/{version}/package.tgz`
///
/// # Errors
/// See [`check_package_id`].
pub fn tarball_path(cache_root: &Path, name: &str, version: &str) -> Result<PathBuf> {
    Ok(package_root(cache_root, name, version)?.join(TARBALL_NAME))
}

/// `{cache}/{name}/{version}/package/package.json`
///
/// # Errors
/// See [`check_package_id`].
pub fn manifest_path(cache_root: &Path, name: &str, version: &str) -> Result<PathBuf> {
    Ok(package_root(cache_root, name, version)?
        .join("package")
        .join("package.json"))
}

/// `{cache}/_git-remotes`
#[must_use]
pub fn git_remotes_dir(cache_root: &Path) -> PathBuf {
    cache_root.join(GIT_REMOTES_DIR)
}

/// `{cache}/_locks`
#[must_use]
pub fn locks_dir(cache_root: &Path) -> PathBuf {
    cache_root.join(LOCKS_DIR)
}

/// Name as it appears in a registry URL path: `@scope/name` becomes `@scope%2fname`.
#[must_use]
pub fn url_encoded_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix('@') {
        if let Some((scope, pkg)) = rest.split_once('/') {
            return format!(
                "@{}%2f{}",
                utf8_percent_encode(scope, URI_COMPONENT),
                utf8_percent_encode(pkg, URI_COMPONENT)
            );
        }
    }
    utf8_percent_encode(name, URI_COMPONENT).to_string()
}

/// `{registry}{encoded name}` (plus `/{version}` when given).
///
/// # Errors
/// Returns an error if the joined URL is invalid.
pub fn registry_url(registry: &Url, name: &str, version: Option<&str>) -> Result<Url> {
    let mut path = url_encoded_name(name);
    if let Some(version) = version {
        path.push('/');
        path.push_str(&utf8_percent_encode(version, URI_COMPONENT).to_string());
    }
    registry.join(&path).map_err(|e| CacheError::BadUri {
        uri: format!("{registry}{path}"),
        reason: e.to_string(),
    })
}
