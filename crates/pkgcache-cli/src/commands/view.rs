//! `pkgcache view <name>[@spec]`

use super::{fail, print_json};
use miette::Result;
use pkgcache_core::{CacheError, CacheService, Manifest, PackageSpecifier, SpecKind};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ViewResult {
    ok: bool,
    manifest: Manifest,
}

pub async fn run(service: &CacheService, cwd: &Path, raw: &str, json: bool) -> Result<()> {
    let spec = PackageSpecifier::parse_in(raw, cwd).map_err(|e| fail(&e, json))?;
    let (name, version_spec) = match &spec.kind {
        SpecKind::Version { name, version } => (name, version.as_str()),
        SpecKind::Range { name, range } => (name, range.as_str()),
        SpecKind::Tag { name, tag } => (name, tag.as_deref().unwrap_or("")),
        _ => {
            let err = CacheError::bad_spec(raw, "view needs a registry package");
            return Err(fail(&err, json));
        }
    };

    let manifest = service
        .resolve(name, version_spec)
        .await
        .map_err(|e| fail(&e, json))?;

    if json {
        print_json(&ViewResult { ok: true, manifest });
    } else {
        print_json(&manifest);
    }
    Ok(())
}
