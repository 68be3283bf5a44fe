use miette::Result;
use pkgcache_core::version::{version_string, VERSION};
use serde::Serialize;

#[derive(Serialize)]
struct VersionResult {
    ok: bool,
    version: &'static str,
}

pub fn run(json: bool) -> Result<()> {
    if json {
        super::print_json(&VersionResult {
            ok: true,
            version: VERSION,
        });
    } else {
        println!("{}", version_string());
    }
    Ok(())
}
