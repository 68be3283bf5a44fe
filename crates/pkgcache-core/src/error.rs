//! Error type shared by every cache and fetch operation.
//!
//! Errors are `Clone` so a single failure can be delivered to every caller
//! waiting on the same in-flight key. Each variant carries a stable npm-style
//! code (see [`codes`]).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Stable error codes.
pub mod codes {
    pub const ETARGET: &str = "ETARGET";
    pub const EINTEGRITY: &str = "EINTEGRITY";
    pub const EBADPKG: &str = "EBADPKG";
    pub const ENOSHASUM: &str = "ENOSHASUM";
    pub const ENOGIT: &str = "ENOGIT";
    pub const EGIT: &str = "EGIT";
    pub const ELOCKED: &str = "ELOCKED";
    pub const ETRANSPORT: &str = "ETRANSPORT";
    pub const EBADSPEC: &str = "EBADSPEC";
    pub const EBADCACHE: &str = "EBADCACHE";
    pub const EBADURI: &str = "EBADURI";
    pub const EJSONPARSE: &str = "EJSONPARSE";
    pub const EIO: &str = "EIO";
    pub const EABANDONED: &str = "EABANDONED";
    pub const ECONFIG: &str = "ECONFIG";
}

/// Result alias used throughout the crate.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Cache/fetch engine error.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Registry answered with a status >= 400.
    #[error("{status} {message}: {uri}")]
    Http {
        uri: String,
        status: u16,
        message: String,
    },

    /// Connection refused, DNS failure, timeout, or a broken body stream.
    #[error("request to {uri} failed: {message}")]
    Transport { uri: String, message: String },

    #[error("No matching version found for {name}@{spec}")]
    NoTarget {
        name: String,
        spec: String,
        /// Versions that were considered, for diagnostics.
        available: Vec<String>,
    },

    #[error("shasum check failed for {}\nExpected: {expected}\nActual:   {actual}\nFrom:     {from}", .path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
        from: String,
    },

    /// Tarball or manifest contents disagree with what was requested.
    #[error("Invalid Package: {0}")]
    BadPackage(String),

    #[error("package lacks shasum: {id}")]
    MissingShasum { id: String },

    #[error("git binary not found: {binary}")]
    NoGit { binary: String },

    #[error("git {args} failed:\n{output}")]
    Git { args: String, output: String },

    #[error("unable to acquire lock {}", .path.display())]
    Locked { path: PathBuf },

    #[error("invalid package specifier '{spec}': {reason}")]
    BadSpec { spec: String, reason: String },

    #[error("invalid cache dir {}", .path.display())]
    BadCacheDir { path: PathBuf },

    #[error("invalid registry URI '{uri}': {reason}")]
    BadUri { uri: String, reason: String },

    #[error("failed to parse JSON from {what}: {message}")]
    Json { what: String, message: String },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The operation that owned an in-flight key went away without finishing.
    #[error("in-flight operation for '{key}' was abandoned")]
    Abandoned { key: String },

    #[error("invalid value for config '{key}': {message}")]
    Config { key: String, message: String },
}

impl CacheError {
    /// Wrap an I/O error with the path it concerns.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    #[must_use]
    pub fn json(what: impl Into<String>, err: &serde_json::Error) -> Self {
        Self::Json {
            what: what.into(),
            message: err.to_string(),
        }
    }

    pub fn bad_package(msg: impl Into<String>) -> Self {
        Self::BadPackage(msg.into())
    }

    pub fn bad_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// The stable code for this error (`E404`, `ETARGET`, ...).
    #[must_use]
    pub fn code(&self) -> String {
        let code = match self {
            Self::Http { status, .. } => return format!("E{status}"),
            Self::Transport { .. } => codes::ETRANSPORT,
            Self::NoTarget { .. } => codes::ETARGET,
            Self::Integrity { .. } => codes::EINTEGRITY,
            Self::BadPackage(_) => codes::EBADPKG,
            Self::MissingShasum { .. } => codes::ENOSHASUM,
            Self::NoGit { .. } => codes::ENOGIT,
            Self::Git { .. } => codes::EGIT,
            Self::Locked { .. } => codes::ELOCKED,
            Self::BadSpec { .. } => codes::EBADSPEC,
            Self::BadCacheDir { .. } => codes::EBADCACHE,
            Self::BadUri { .. } => codes::EBADURI,
            Self::Json { .. } => codes::EJSONPARSE,
            Self::Io { .. } => codes::EIO,
            Self::Abandoned { .. } => codes::EABANDONED,
            Self::Config { .. } => codes::ECONFIG,
        };
        code.to_string()
    }

    /// HTTP status, if this error came from a registry response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a download that failed this way may succeed if attempted again.
    ///
    /// Only missing responses, 408 and 5xx qualify. Integrity failures never do.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this is a missing-file error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Attach path context to `io::Result`s.
pub trait IoResultExt<T> {
    fn with_path(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: &Path) -> Result<T> {
        self.map_err(|e| CacheError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_code_from_status() {
        let err = CacheError::Http {
            uri: "https://registry.example/foo".into(),
            status: 404,
            message: "Not Found".into(),
        };
        assert_eq!(err.code(), "E404");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_retry_taxonomy() {
        let transport = CacheError::Transport {
            uri: "u".into(),
            message: "connection refused".into(),
        };
        let timeout = CacheError::Http {
            uri: "u".into(),
            status: 408,
            message: String::new(),
        };
        let server = CacheError::Http {
            uri: "u".into(),
            status: 503,
            message: String::new(),
        };
        let not_found = CacheError::Http {
            uri: "u".into(),
            status: 404,
            message: String::new(),
        };
        let integrity = CacheError::Integrity {
            path: PathBuf::from("/tmp/x.tgz"),
            expected: "a".into(),
            actual: "b".into(),
            from: "u".into(),
        };

        assert!(transport.is_retryable());
        assert!(timeout.is_retryable());
        assert!(server.is_retryable());
        assert!(!not_found.is_retryable());
        assert!(!integrity.is_retryable());
    }

    #[test]
    fn test_error_codes_uppercase() {
        let all_codes = [
            codes::ETARGET,
            codes::EINTEGRITY,
            codes::EBADPKG,
            codes::ENOSHASUM,
            codes::ENOGIT,
            codes::EGIT,
            codes::ELOCKED,
            codes::ETRANSPORT,
            codes::EBADSPEC,
            codes::EBADCACHE,
            codes::EBADURI,
            codes::EJSONPARSE,
            codes::EIO,
            codes::EABANDONED,
            codes::ECONFIG,
        ];

        for code in all_codes {
            assert!(code.starts_with('E'));
            assert!(
                code.chars().all(|c| c.is_ascii_uppercase()),
                "Error code '{code}' should be uppercase"
            );
        }
    }

    #[test]
    fn test_io_error_keeps_path_and_clones() {
        let err = CacheError::io(
            "/cache/foo",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let cloned = err.clone();
        assert!(cloned.is_not_found());
        assert!(cloned.to_string().contains("/cache/foo"));
        assert_eq!(err.code(), codes::EIO);
    }
}
