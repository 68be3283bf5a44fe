//! Subcommand implementations.

pub mod cache;
pub mod index;
pub mod version;
pub mod view;

use pkgcache_core::CacheError;
use serde::Serialize;

/// Error entry for JSON output.
#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&CacheError> for ErrorInfo {
    fn from(err: &CacheError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct FailureResult {
    ok: bool,
    error: ErrorInfo,
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("error: failed to serialize output: {e}"),
    }
}

/// Report `err`; with `json` an `{"ok": false}` document is printed first.
pub fn fail(err: &CacheError, json: bool) -> miette::Report {
    if json {
        print_json(&FailureResult {
            ok: false,
            error: ErrorInfo::from(err),
        });
    }
    miette::miette!(code = err.code(), "{err}")
}
