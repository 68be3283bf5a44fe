//! npm-flavoured semver ranges on top of the `semver` crate.
//!
//! Handles the npm syntax `semver::VersionReq` does not:
//! - OR ranges: `^1.0.0 || ^2.0.0`
//! - Hyphen ranges: `1.0.0 - 2.0.0`
//! - X-ranges and partials: `1.x`, `1.2.*`, `1`, `*`
//! - Space-separated comparators: `>= 2.1.2 < 3.0.0`

use crate::error::{CacheError, Result};
use semver::{Version, VersionReq};

/// A parsed version range.
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse an npm range expression.
    ///
    /// # Errors
    /// Returns [`CacheError::BadSpec`] if no alternative parses.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        let mut alternatives = Vec::new();

        for alt in raw.split("||").map(str::trim) {
            let alt = if alt.is_empty() { "*" } else { alt };
            alternatives.push(parse_single(alt).ok_or_else(|| {
                CacheError::bad_spec(raw, format!("invalid version range '{alt}'"))
            })?);
        }

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    /// The range as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this is the match-anything range (`*`, `x` or empty).
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self.raw.as_str(), "" | "*" | "x" | "X")
    }

    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// Highest version in `versions` that satisfies the range.
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        versions.into_iter().filter(|v| self.matches(v)).max()
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse an exact version, tolerating a leading `v` or `=`.
#[must_use]
pub fn parse_version_loose(input: &str) -> Option<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('=').unwrap_or(trimmed).trim_start();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed).ok()
}

fn parse_single(range: &str) -> Option<VersionReq> {
    let range = range.trim();

    if let Some((start, end)) = range.split_once(" - ") {
        let (start, end) = (start.trim(), end.trim());
        if start.is_empty() || end.is_empty() {
            return None;
        }
        return VersionReq::parse(&format!(">={start}, <={end}")).ok();
    }

    if is_partial(range) || range.contains(['x', 'X', '*']) {
        return VersionReq::parse(&convert_x_range(range)).ok();
    }

    let bare = range
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == 'v');
    if bare && parse_version_loose(range).is_some() {
        // A bare complete version means exactly that version
        return VersionReq::parse(&format!("={}", range.trim_start_matches('v'))).ok();
    }

    VersionReq::parse(&join_comparators(range)).ok()
}

/// `1` or `1.2`: digits separated by dots, fewer than three parts.
fn is_partial(range: &str) -> bool {
    let parts: Vec<&str> = range.split('.').collect();
    parts.len() < 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn convert_x_range(range: &str) -> String {
    let range = range.trim();
    if matches!(range, "*" | "x" | "X") {
        return ">=0.0.0".to_string();
    }

    let parts: Vec<&str> = range.split('.').collect();
    let wild = |p: &str| matches!(p, "x" | "X" | "*");

    let numbers: Vec<u64> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    match numbers.as_slice() {
        [m] if parts.len() == 1 => return format!(">={m}.0.0, <{}.0.0", m + 1),
        [m, n] if parts.len() == 2 => return format!(">={m}.{n}.0, <{m}.{}.0", n + 1),
        _ => {}
    }

    match parts.as_slice() {
        [major, minor] | [major, minor, _] if wild(*minor) => match major.parse::<u64>() {
            Ok(m) => format!(">={m}.0.0, <{}.0.0", m + 1),
            Err(_) => range.replace(['x', 'X', '*'], "0"),
        },
        [major, minor, patch] if wild(*patch) => {
            match (major.parse::<u64>(), minor.parse::<u64>()) {
                (Ok(m), Ok(n)) => format!(">={m}.{n}.0, <{m}.{}.0", n + 1),
                _ => range.replace(['x', 'X', '*'], "0"),
            }
        }
        _ => range.replace(['x', 'X', '*'], "0"),
    }
}

/// `>= 2.1.2 < 3.0.0` becomes `>=2.1.2, <3.0.0`.
fn join_comparators(range: &str) -> String {
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op = String::new();

    for token in range.split_whitespace() {
        if token.chars().any(|c| c.is_ascii_digit()) {
            comparators.push(format!("{pending_op}{token}"));
            pending_op.clear();
        } else {
            pending_op.push_str(token);
        }
    }

    if comparators.is_empty() {
        return range.to_string();
    }
    comparators.join(", ")
}
