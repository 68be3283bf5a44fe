//! `pkgcache cache add|ls|clean|read`

use super::{fail, print_json, ErrorInfo};
use miette::Result;
use pkgcache_core::{CacheService, CachedPackage, Manifest, PackageSpecifier};
use serde::Serialize;
use std::path::Path;

/// One added package for JSON output.
#[derive(Serialize)]
struct AddedPackage {
    spec: String,
    id: String,
    name: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    shasum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved: Option<String>,
}

#[derive(Serialize)]
struct AddError {
    spec: String,
    #[serde(flatten)]
    error: ErrorInfo,
}

#[derive(Serialize)]
struct CacheAddResult {
    ok: bool,
    added: Vec<AddedPackage>,
    errors: Vec<AddError>,
}

#[derive(Serialize)]
struct ListedPackage {
    name: String,
    version: String,
}

#[derive(Serialize)]
struct CacheListResult {
    ok: bool,
    packages: Vec<ListedPackage>,
}

#[derive(Serialize)]
struct CacheCleanResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

#[derive(Serialize)]
struct CacheReadResult {
    ok: bool,
    manifest: Manifest,
}

pub async fn add(service: &CacheService, cwd: &Path, specs: &[String], json: bool) -> Result<()> {
    let mut added = Vec::new();
    let mut errors = Vec::new();

    for raw in specs {
        let result = match PackageSpecifier::parse_in(raw, cwd) {
            Ok(spec) => service.add(&spec).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(manifest) => added.push(AddedPackage {
                spec: raw.clone(),
                id: manifest.spec_id(),
                name: manifest.name,
                version: manifest.version,
                shasum: manifest.shasum,
                resolved: manifest.resolved,
            }),
            Err(e) => errors.push(AddError {
                spec: raw.clone(),
                error: ErrorInfo::from(&e),
            }),
        }
    }

    let failed = errors.len();
    if json {
        print_json(&CacheAddResult {
            ok: errors.is_empty(),
            added,
            errors,
        });
    } else {
        for pkg in &added {
            println!("+ {}", pkg.id);
        }
        for err in &errors {
            eprintln!("! {}: {} {}", err.spec, err.error.code, err.error.message);
        }
    }

    if failed > 0 {
        return Err(miette::miette!(
            code = "EADD",
            "{failed} of {} specifiers could not be added",
            specs.len()
        ));
    }
    Ok(())
}

pub fn ls(service: &CacheService, prefix: Option<&str>, json: bool) -> Result<()> {
    let packages = service.ls(prefix).map_err(|e| fail(&e, json))?;

    if json {
        print_json(&CacheListResult {
            ok: true,
            packages: packages
                .into_iter()
                .map(|CachedPackage { name, version }| ListedPackage { name, version })
                .collect(),
        });
    } else if packages.is_empty() {
        println!("Cache is empty.");
    } else {
        for pkg in &packages {
            println!("{pkg}");
        }
    }
    Ok(())
}

pub fn clean(service: &CacheService, target: Option<&str>, json: bool) -> Result<()> {
    service.clean(target).map_err(|e| fail(&e, json))?;

    if json {
        print_json(&CacheCleanResult {
            ok: true,
            target: target.map(str::to_string),
        });
    } else {
        match target {
            Some(target) => println!("Removed {target} from the cache."),
            None => println!("Cache cleaned."),
        }
    }
    Ok(())
}

pub async fn read(service: &CacheService, name: &str, version: &str, json: bool) -> Result<()> {
    let manifest = service
        .read(name, version, service.config().force)
        .await
        .map_err(|e| fail(&e, json))?;

    if json {
        print_json(&CacheReadResult { ok: true, manifest });
    } else {
        print_json(&manifest);
    }
    Ok(())
}
