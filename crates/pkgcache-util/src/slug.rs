//! Filesystem-safe identifiers derived from arbitrary strings.

use crate::hash::sha1_bytes;

/// Collapse every run of non-alphanumeric ASCII characters into a single `-`.
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_gap = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            in_gap = false;
        } else if !in_gap {
            out.push('-');
            in_gap = true;
        }
    }

    out
}

/// Build `{slug}-{sha1prefix}` where the slug is taken from `label` and the
/// digest from `hashed`.
///
/// `max_slug` truncates the slug (after trimming leading/trailing dashes when
/// `trim` is set); `hash_len` is the number of hex digits kept.
#[must_use]
pub fn hashed_id(label: &str, hashed: &str, max_slug: Option<usize>, hash_len: usize) -> String {
    let mut slug = slugify(label);
    if let Some(max) = max_slug {
        slug = slug.trim_matches('-').chars().take(max).collect();
    }
    let digest = sha1_bytes(hashed.as_bytes());
    format!("{slug}-{}", &digest[..hash_len.min(digest.len())])
}
