//! Named resolution: versions, ranges, tags and the fully-cached fast path.

mod common;

use common::MockRegistry;
use pkgcache_core::paths::{manifest_path, tarball_path};
use pkgcache_core::PackageSpecifier;
use tempfile::tempdir;

async fn registry_with(versions: &[&str], latest: &str) -> MockRegistry {
    let registry = MockRegistry::start().await;
    for v in versions {
        registry.publish("pkg", v);
    }
    registry.set_tag("pkg", "latest", latest);
    registry
}

#[tokio::test]
async fn test_caret_range_picks_max_satisfying() {
    let registry = registry_with(&["1.2.0", "1.2.5", "1.3.0", "2.0.0"], "2.0.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let manifest = service.add_name_range("pkg", "^1.2.0").await.unwrap();
    assert_eq!(manifest.version, "1.3.0");

    let manifest = service.add_name_range("pkg", "~1.2.0").await.unwrap();
    assert_eq!(manifest.version, "1.2.5");
}

#[tokio::test]
async fn test_latest_tag_wins_when_it_satisfies() {
    let registry = registry_with(&["1.2.0", "1.2.5", "1.3.0", "2.0.0"], "1.2.5").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let manifest = service.add_name_range("pkg", "^1.2.0").await.unwrap();
    assert_eq!(manifest.version, "1.2.5");
    assert!(tarball_path(dir.path(), "pkg", "1.2.5").unwrap().is_file());
    assert!(manifest_path(dir.path(), "pkg", "1.2.5").unwrap().is_file());
}

#[tokio::test]
async fn test_unsatisfiable_range_is_etarget() {
    let registry = registry_with(&["1.0.0"], "1.0.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let err = service.add_name_range("pkg", "^3.0.0").await.unwrap_err();
    assert_eq!(err.code(), "ETARGET");
}

#[tokio::test]
async fn test_exact_version_missing_is_404() {
    let registry = registry_with(&["1.0.0"], "1.0.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let err = service.add_name_version("pkg", "9.9.9").await.unwrap_err();
    assert_eq!(err.code(), "E404");
}

#[tokio::test]
async fn test_tags() {
    let registry = registry_with(&["1.0.0", "2.0.0-beta.1"], "1.0.0").await;
    registry.set_tag("pkg", "next", "2.0.0-beta.1");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let next = service.add_name_tag("pkg", Some("next")).await.unwrap();
    assert_eq!(next.version, "2.0.0-beta.1");

    let default = service.add_name_tag("pkg", None).await.unwrap();
    assert_eq!(default.version, "1.0.0");

    let err = service.add_name_tag("pkg", Some("nope")).await.unwrap_err();
    assert_eq!(err.code(), "ETARGET");
}

#[tokio::test]
async fn test_missing_default_tag_falls_back_to_star() {
    let registry = MockRegistry::start().await;
    registry.publish("pkg", "1.0.0");
    registry.publish("pkg", "1.5.0");
    let mut doc = registry.json("/pkg");
    doc["dist-tags"] = serde_json::json!({});
    registry.set_json("/pkg", &doc);

    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let manifest = service.add_named("pkg", "").await.unwrap();
    assert_eq!(manifest.version, "1.5.0");
}

#[tokio::test]
async fn test_fully_cached_version_needs_no_tarball_request() {
    let registry = registry_with(&["1.0.0"], "1.0.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    service.add_name_version("pkg", "1.0.0").await.unwrap();
    let before = registry.total_hits();

    let again = service.add_name_version("pkg", "1.0.0").await.unwrap();
    assert_eq!(again.version, "1.0.0");
    assert_eq!(registry.total_hits(), before);
}

#[tokio::test]
async fn test_force_refetches_tarball() {
    let registry = registry_with(&["1.0.0"], "1.0.0").await;
    let dir = tempdir().unwrap();
    registry.service(dir.path()).add_name_version("pkg", "1.0.0").await.unwrap();
    assert_eq!(registry.hits("/pkg/-/pkg-1.0.0.tgz"), 1);

    let forced = pkgcache_core::CacheService::new(registry.config(dir.path()).with_force(true)).unwrap();
    forced.add_name_version("pkg", "1.0.0").await.unwrap();
    assert_eq!(registry.hits("/pkg/-/pkg-1.0.0.tgz"), 2);
}

#[tokio::test]
async fn test_missing_shasum_requires_force() {
    let registry = MockRegistry::start().await;
    registry.publish_with("pkg", "1.0.0", common::tarball("pkg", "1.0.0"), None);
    let dir = tempdir().unwrap();

    let err = registry
        .service(dir.path())
        .add_name_version("pkg", "1.0.0")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ENOSHASUM");

    let forced = pkgcache_core::CacheService::new(registry.config(dir.path()).with_force(true)).unwrap();
    let manifest = forced.add_name_version("pkg", "1.0.0").await.unwrap();
    assert!(manifest.shasum.is_some());
}

#[tokio::test]
async fn test_scoped_package() {
    let registry = MockRegistry::start().await;
    registry.publish("@scope/thing", "0.1.0");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let manifest = service.add_named("@scope/thing", "latest").await.unwrap();
    assert_eq!(manifest.spec_id(), "@scope/thing@0.1.0");
    assert!(tarball_path(dir.path(), "@scope/thing", "0.1.0").unwrap().is_file());
}

#[tokio::test]
async fn test_add_stamps_from() {
    let registry = registry_with(&["1.0.0", "1.1.0"], "1.1.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let spec = PackageSpecifier::parse("pkg@^1.0.0").unwrap();
    let manifest = service.add(&spec).await.unwrap();
    assert_eq!(manifest.version, "1.1.0");
    assert_eq!(manifest.from.as_deref(), Some("pkg@^1.0.0"));
    assert_eq!(manifest.id.as_deref(), Some("pkg@1.1.0"));

    let cached = service.read("pkg", "1.1.0", false).await.unwrap();
    assert_eq!(cached.from.as_deref(), Some("pkg@^1.0.0"));
    assert_eq!(cached.shasum, manifest.shasum);
}

#[tokio::test]
async fn test_resolve_does_not_download() {
    let registry = registry_with(&["1.0.0", "1.4.0"], "1.4.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let manifest = service.resolve("pkg", "^1.0.0").await.unwrap();
    assert_eq!(manifest.version, "1.4.0");
    assert_eq!(registry.hits("/pkg/-/pkg-1.4.0.tgz"), 0);
}

#[tokio::test]
async fn test_unpack_extracts_package() {
    let registry = registry_with(&["1.0.0"], "1.0.0").await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let target = dir.path().join("out").join("pkg");

    service.unpack("pkg", "1.0.0", &target).await.unwrap();
    assert!(target.join("package.json").is_file());
    assert!(target.join("index.js").is_file());
}
