//! Tarball cache store: `{cache}/{name}/{version}/package.tgz` plus the
//! extracted `package/package.json` beside it.

mod local;
mod remote;
pub mod tarball;

pub(crate) use local::write_manifest;
