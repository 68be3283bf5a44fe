//! Git dependencies: URL normalization, the git runner and the mirror cache.
//!
//! Accepted forms:
//! - `git+https://host/repo.git#v1.0.0`, `git+ssh://git@host/repo.git`
//! - `git://host/repo.git`, `git+file:///path/to/repo`
//! - `git@host:user/repo.git` (scp-like)
//! - `github:user/repo`, `user/repo`

mod exec;
mod remote;

pub use exec::{filtered_env, GitRunner, GIT_ENV_ALLOW};

use crate::error::{CacheError, Result};
use pkgcache_util::slug::hashed_id;

/// Treeish used when the URL has no `#fragment`.
pub const DEFAULT_TREEISH: &str = "HEAD";

/// A git dependency URL split into what `git clone` needs and what to check out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUrl {
    /// What the user wrote.
    pub original: String,
    /// URL handed to `git clone`, without `git+` or `#treeish`.
    pub clone_url: String,
    pub treeish: String,
}

impl GitUrl {
    /// Normalize a git specifier.
    ///
    /// # Errors
    /// [`CacheError::BadSpec`] when no repository URL remains, or when the
    /// URL or treeish would be read by git as an option.
    pub fn parse(input: &str) -> Result<Self> {
        let original = input.trim().to_string();
        let (url, treeish) = match original.split_once('#') {
            Some((url, treeish)) if !treeish.is_empty() => (url, treeish.to_string()),
            Some((url, _)) => (url, DEFAULT_TREEISH.to_string()),
            None => (original.as_str(), DEFAULT_TREEISH.to_string()),
        };

        let url = url.strip_prefix("git+").unwrap_or(url);
        let clone_url = if let Some(path) = url.strip_prefix("github:") {
            github_url(path)
        } else if is_shorthand(url) {
            github_url(url)
        } else {
            url.to_string()
        };

        if clone_url.is_empty() {
            return Err(CacheError::bad_spec(input, "missing repository URL"));
        }
        if clone_url.starts_with('-') || treeish.starts_with('-') {
            return Err(CacheError::bad_spec(input, "URL and treeish cannot start with '-'"));
        }

        Ok(Self {
            original,
            clone_url,
            treeish,
        })
    }

    /// Directory name of this repository's mirror under `_git-remotes`.
    #[must_use]
    pub fn repo_id(&self) -> String {
        repo_id(&self.clone_url)
    }

    /// `_resolved` value pinning `commit`.
    #[must_use]
    pub fn resolved(&self, commit: &str) -> String {
        if is_scp_like(&self.clone_url) {
            format!("git+ssh://{}#{commit}", self.clone_url)
        } else {
            format!("git+{}#{commit}", self.clone_url)
        }
    }
}

/// `slug(url)-sha1(url)[..8]`
#[must_use]
pub fn repo_id(clone_url: &str) -> String {
    hashed_id(clone_url, clone_url, None, 8)
}

fn github_url(path: &str) -> String {
    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    format!("https://github.com/{path}.git")
}

/// `user/repo` with nothing else going on.
fn is_shorthand(url: &str) -> bool {
    let mut parts = url.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(user), Some(repo), None)
            if !user.is_empty()
                && !repo.is_empty()
                && !user.starts_with(['.', '@'])
                && !url.contains(':')
    )
}

/// `user@host:path`, which git treats as ssh.
fn is_scp_like(url: &str) -> bool {
    !url.contains("://")
        && url
            .split_once(':')
            .is_some_and(|(host, _)| !host.is_empty() && !host.contains('/'))
}
