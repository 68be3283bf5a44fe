//! Package specifier parsing.
//!
//! Classifies what a user typed:
//! - `react`, `react@18.2.0`, `react@^18`, `react@next`, `@types/node@20`
//! - `https://host/pkg.tgz`
//! - `git+https://host/repo.git#v1`, `git://host/repo`, `github:user/repo`, `user/repo`
//! - `./pkg.tgz`, `/abs/dir`, `file:../dir`

use crate::error::{CacheError, Result};
use crate::range::{parse_version_loose, VersionRange};
use std::path::{Path, PathBuf};

/// What a specifier refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecKind {
    /// `name@1.2.3`
    Version { name: String, version: String },
    /// `name@^1.2.0`
    Range { name: String, range: String },
    /// `name@next`, or bare `name` (`tag: None`, the configured default tag).
    Tag { name: String, tag: Option<String> },
    /// An http(s) tarball URL.
    Remote { url: String },
    /// A git URL, possibly with `#treeish`.
    Git { url: String },
    /// A tarball on disk.
    LocalTarball { path: PathBuf },
    /// A package directory on disk.
    Directory { path: PathBuf },
}

/// A parsed specifier together with the text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpecifier {
    pub raw: String,
    pub kind: SpecKind,
}

impl PackageSpecifier {
    /// Parse relative to the current directory.
    ///
    /// # Errors
    /// Returns [`CacheError::BadSpec`] for malformed input.
    pub fn parse(input: &str) -> Result<Self> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::parse_in(input, &cwd)
    }

    /// Parse, resolving relative paths against `cwd`.
    ///
    /// # Errors
    /// Returns [`CacheError::BadSpec`] for malformed input.
    pub fn parse_in(input: &str, cwd: &Path) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(CacheError::bad_spec(input, "empty specifier"));
        }

        let kind = if let Some(kind) = classify_url(raw) {
            kind
        } else if let Some(kind) = classify_path(raw, cwd) {
            kind
        } else if is_github_shorthand(raw) {
            SpecKind::Git {
                url: format!("github:{raw}"),
            }
        } else {
            classify_named(raw)?
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    /// Registry package name, for named specifiers.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            SpecKind::Version { name, .. }
            | SpecKind::Range { name, .. }
            | SpecKind::Tag { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackageSpecifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn classify_url(raw: &str) -> Option<SpecKind> {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(SpecKind::Remote {
            url: raw.to_string(),
        });
    }
    if lower.starts_with("git+") || lower.starts_with("git://") || lower.starts_with("github:") {
        return Some(SpecKind::Git {
            url: raw.to_string(),
        });
    }
    None
}

fn is_tarball_name(raw: &str) -> bool {
    let lower = raw.to_ascii_lowercase();
    lower.ends_with(".tgz") || lower.ends_with(".tar.gz") || lower.ends_with(".tar")
}

fn looks_like_path(raw: &str) -> bool {
    raw.starts_with('.')
        || raw.starts_with('/')
        || raw.starts_with("~/")
        || raw.starts_with("file:")
        || (cfg!(windows) && raw.len() > 2 && raw.as_bytes()[1] == b':')
}

fn classify_path(raw: &str, cwd: &Path) -> Option<SpecKind> {
    let explicit = looks_like_path(raw);
    let stripped = raw.strip_prefix("file:").unwrap_or(raw);
    let path = match stripped.strip_prefix("~/") {
        Some(rest) => dirs_next::home_dir().map_or_else(|| PathBuf::from(rest), |h| h.join(rest)),
        None => cwd.join(stripped),
    };

    if path.is_dir() && (explicit || path.join("package.json").is_file()) {
        return Some(SpecKind::Directory { path });
    }
    if path.is_file() && (explicit || is_tarball_name(raw)) {
        return Some(SpecKind::LocalTarball { path });
    }
    if explicit {
        // Missing paths still classify so the caller reports a file error
        return Some(if is_tarball_name(raw) {
            SpecKind::LocalTarball { path }
        } else {
            SpecKind::Directory { path }
        });
    }
    None
}

/// `user/repo` or `user/repo#ref`.
fn is_github_shorthand(raw: &str) -> bool {
    if raw.starts_with('@') || raw.contains('@') || raw.contains(':') {
        return false;
    }
    let repo_part = raw.split('#').next().unwrap_or(raw);
    let Some((user, repo)) = repo_part.split_once('/') else {
        return false;
    };
    !user.is_empty()
        && !repo.is_empty()
        && !repo.contains('/')
        && !user.starts_with('.')
        && !raw.chars().any(char::is_whitespace)
}

fn classify_named(raw: &str) -> Result<SpecKind> {
    let (name, spec) = split_name(raw)?;
    validate_name(raw, name)?;
    let name = name.to_string();

    let Some(spec) = spec else {
        return Ok(SpecKind::Tag { name, tag: None });
    };

    if let Some(kind) = classify_url(spec) {
        return Ok(kind);
    }

    if let Some(version) = parse_version_loose(spec) {
        return Ok(SpecKind::Version {
            name,
            version: version.to_string(),
        });
    }

    if VersionRange::parse(spec).is_ok() {
        return Ok(SpecKind::Range {
            name,
            range: spec.to_string(),
        });
    }

    if spec.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(CacheError::bad_spec(raw, format!("invalid tag '{spec}'")));
    }
    Ok(SpecKind::Tag {
        name,
        tag: Some(spec.to_string()),
    })
}

/// Split `name@spec`, honouring the leading `@` of scoped names.
fn split_name(raw: &str) -> Result<(&str, Option<&str>)> {
    let search_from = if raw.starts_with('@') {
        let Some(slash) = raw.find('/') else {
            return Err(CacheError::bad_spec(raw, "scoped name is missing '/'"));
        };
        if slash == 1 {
            return Err(CacheError::bad_spec(raw, "empty scope"));
        }
        slash + 1
    } else {
        0
    };

    match raw[search_from..].find('@') {
        Some(at) => {
            let at = search_from + at;
            let spec = &raw[at + 1..];
            if spec.is_empty() {
                return Err(CacheError::bad_spec(raw, "empty version specifier"));
            }
            Ok((&raw[..at], Some(spec)))
        }
        None => Ok((raw, None)),
    }
}

fn validate_name(raw: &str, name: &str) -> Result<()> {
    let bare = match name.strip_prefix('@') {
        Some(scoped) => {
            let (scope, pkg) = scoped.split_once('/').unwrap_or((scoped, ""));
            if scope.is_empty() || pkg.is_empty() || pkg.contains('/') {
                return Err(CacheError::bad_spec(raw, "invalid scoped name"));
            }
            check_chars(raw, scope)?;
            pkg
        }
        None => name,
    };

    if bare.is_empty() || bare.starts_with('.') || bare.starts_with('_') {
        return Err(CacheError::bad_spec(raw, format!("invalid name '{name}'")));
    }
    check_chars(raw, bare)
}

fn check_chars(raw: &str, part: &str) -> Result<()> {
    for c in part.chars() {
        if !c.is_alphanumeric() && !matches!(c, '-' | '_' | '.' | '~') {
            return Err(CacheError::bad_spec(
                raw,
                format!("invalid character '{c}' in name"),
            ));
        }
    }
    Ok(())
}
