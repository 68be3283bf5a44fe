//! Running the `git` binary.

use crate::error::{CacheError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::trace;

/// `GIT_*` variables passed through to git; every other `GIT_*` is dropped.
pub const GIT_ENV_ALLOW: &[&str] = &[
    "GIT_SSH",
    "GIT_SSL_NO_VERIFY",
    "GIT_PROXY_COMMAND",
    "GIT_SSL_CAINFO",
];

/// Filter an environment down to what git subprocesses may see.
pub fn filtered_env<I>(vars: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter(|(key, _)| {
            let key = key.to_string_lossy();
            !key.starts_with("GIT_") || GIT_ENV_ALLOW.contains(&key.as_ref())
        })
        .collect()
}

/// Runs git with a filtered environment.
#[derive(Debug, Clone)]
pub struct GitRunner {
    binary: String,
    env: Vec<(OsString, OsString)>,
}

impl GitRunner {
    /// Runner for `binary` (a name on `PATH` or a path). The environment is
    /// captured once here.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            env: filtered_env(std::env::vars_os()),
        }
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Locate the binary.
    ///
    /// # Errors
    /// [`CacheError::NoGit`] when it cannot be found.
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(&self.binary).map_err(|_| CacheError::NoGit {
            binary: self.binary.clone(),
        })
    }

    /// Run `git <args>` in `cwd` and return trimmed stdout.
    ///
    /// # Errors
    /// [`CacheError::NoGit`] if git is missing, [`CacheError::Git`] with the
    /// combined output on a non-zero exit.
    pub async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let binary = self.resolve_binary()?;
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if cfg!(windows) {
            full.extend(["-c", "core.longpaths=true"]);
        }
        full.extend_from_slice(args);

        let mut cmd = Command::new(&binary);
        cmd.args(&full)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        trace!(args = ?full, cwd = ?cwd, "git");
        let output = cmd.output().await.map_err(|e| CacheError::Git {
            args: full.join(" "),
            output: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CacheError::Git {
                args: full.join(" "),
                output: format!("{stdout}{stderr}").trim_end().to_string(),
            });
        }
        Ok(stdout.trim().to_string())
    }
}
