use std::fmt::Write;

/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// npm release whose cache layout and engine checks are followed. Used as
/// the running npm version when `npm-version` is not configured.
pub const NPM_COMPAT_VERSION: &str = "2.15.12";

/// Returns a formatted version string including build metadata if available.
#[must_use]
pub fn version_string() -> String {
    let mut s = format!("pkgcache {VERSION}");

    if let Some(hash) = option_env!("PKGCACHE_BUILD_GIT_HASH") {
        let _ = write!(s, " ({hash})");
    }

    s
}

/// Default `User-Agent` for registry requests.
#[must_use]
pub fn user_agent() -> String {
    format!(
        "pkgcache/{VERSION} {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
