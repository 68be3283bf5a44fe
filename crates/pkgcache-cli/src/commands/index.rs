//! `pkgcache update-index`

use super::{fail, print_json};
use miette::Result;
use pkgcache_core::{update_index, CacheService};
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct IndexResult {
    ok: bool,
    packages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<i64>,
}

pub async fn run(service: &CacheService, staleness_secs: u64, json: bool) -> Result<()> {
    let index = update_index(service.registry(), Duration::from_secs(staleness_secs))
        .await
        .map_err(|e| fail(&e, json))?;

    let updated = index.get("_updated").and_then(serde_json::Value::as_i64);
    let packages = index
        .as_object()
        .map_or(0, |map| map.keys().filter(|k| !k.starts_with('_')).count());

    if json {
        print_json(&IndexResult {
            ok: true,
            packages,
            updated,
        });
    } else {
        println!("{packages} packages in index");
    }
    Ok(())
}
