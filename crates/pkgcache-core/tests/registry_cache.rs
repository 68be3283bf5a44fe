//! Metadata cache behaviour against a mock registry.

mod common;

use common::MockRegistry;
use filetime::FileTime;
use pkgcache_core::registry::{GetOptions, ResponseSource};
use pkgcache_core::update_index;
use reqwest::Method;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

fn age(path: &Path, secs: u64) {
    let then = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(secs));
    filetime::set_file_mtime(path, then).unwrap();
}

#[tokio::test]
async fn test_round_trip_within_ttl_hits_network_once() {
    let registry = MockRegistry::start().await;
    registry.publish("left-pad", "1.0.0");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/left-pad");

    let first = service.registry().get(&uri, GetOptions::default()).await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.source, ResponseSource::Network);
    assert!(first.data.get("_etag").is_none());

    let second = service.registry().get(&uri, GetOptions::default()).await.unwrap();
    assert_eq!(second.status, 304);
    assert_eq!(second.source, ResponseSource::Fresh);
    assert_eq!(second.data, first.data);
    assert_eq!(registry.hits("/left-pad"), 1);
}

#[tokio::test]
async fn test_expired_entry_revalidates_with_etag() {
    let registry = MockRegistry::start().await;
    registry.publish("left-pad", "1.0.0");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/left-pad");

    service.registry().get(&uri, GetOptions::default()).await.unwrap();
    let sidecar = service.registry().sidecar_path(&uri).unwrap();
    age(&sidecar, 3600);

    let resp = service.registry().get(&uri, GetOptions::default()).await.unwrap();
    assert_eq!(resp.source, ResponseSource::Revalidated);
    assert_eq!(resp.status, 304);
    assert_eq!(registry.hits("/left-pad"), 2);

    // Revalidation renewed the entry
    let resp = service.registry().get(&uri, GetOptions::default()).await.unwrap();
    assert_eq!(resp.source, ResponseSource::Fresh);
    assert_eq!(registry.hits("/left-pad"), 2);
}

#[tokio::test]
async fn test_changed_document_replaces_cache() {
    let registry = MockRegistry::start().await;
    registry.publish("pkg", "1.0.0");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/pkg");

    service.registry().get(&uri, GetOptions::default()).await.unwrap();
    registry.publish("pkg", "1.1.0");
    age(&service.registry().sidecar_path(&uri).unwrap(), 3600);

    let resp = service.registry().get(&uri, GetOptions::default()).await.unwrap();
    assert_eq!(resp.source, ResponseSource::Network);
    assert!(resp.data["versions"].get("1.1.0").is_some());
}

#[tokio::test]
async fn test_stale_ok_serves_cache_and_refreshes() {
    let registry = MockRegistry::start().await;
    registry.publish("pkg", "1.0.0");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/pkg");

    service.registry().get(&uri, GetOptions::default()).await.unwrap();
    age(&service.registry().sidecar_path(&uri).unwrap(), 3600);

    let resp = service
        .registry()
        .get(
            &uri,
            GetOptions {
                stale_ok: true,
                timeout: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.source, ResponseSource::Stale);

    for _ in 0..50 {
        if registry.hits("/pkg") == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(registry.hits("/pkg"), 2);
}

#[tokio::test]
async fn test_server_error_falls_back_to_cache() {
    let registry = MockRegistry::start().await;
    registry.publish("pkg", "1.0.0");
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/pkg");

    service.registry().get(&uri, GetOptions::default()).await.unwrap();
    age(&service.registry().sidecar_path(&uri).unwrap(), 3600);
    registry.fail("/pkg", 503, 1);

    let resp = service.registry().get(&uri, GetOptions::default()).await.unwrap();
    assert_eq!(resp.source, ResponseSource::Fallback);
    assert_eq!(resp.data["name"], "pkg");
}

#[tokio::test]
async fn test_not_found_propagates() {
    let registry = MockRegistry::start().await;
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/missing");

    let err = service
        .registry()
        .get(&uri, GetOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E404");
    assert!(!service.registry().sidecar_path(&uri).unwrap().exists());
}

#[tokio::test]
async fn test_write_invalidates_cached_tree() {
    let registry = MockRegistry::start().await;
    registry.publish("pkg", "1.0.0");
    registry.set_json("/pkg/-rev/1-abc", &json!({"ok": true}));
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/pkg");

    service.registry().get(&uri, GetOptions::default()).await.unwrap();
    let sidecar = service.registry().sidecar_path(&uri).unwrap();
    assert!(sidecar.exists());

    service
        .registry()
        .request(Method::DELETE, &registry.url("/pkg/-rev/1-abc"), None)
        .await
        .unwrap();
    assert!(!sidecar.exists());
}

#[tokio::test]
async fn test_concurrent_gets_share_one_request() {
    let registry = MockRegistry::start().await;
    registry.publish("pkg", "1.0.0");
    registry.set_delay(Duration::from_millis(100));
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());
    let uri = registry.url("/pkg");

    let (a, b, c) = tokio::join!(
        service.registry().get(&uri, GetOptions::default()),
        service.registry().get(&uri, GetOptions::default()),
        service.registry().get(&uri, GetOptions::default()),
    );
    assert_eq!(a.unwrap().data, b.unwrap().data);
    assert!(c.is_ok());
    assert_eq!(registry.hits("/pkg"), 1);
}

#[tokio::test]
async fn test_index_full_then_delta() {
    let registry = MockRegistry::start().await;
    registry.set_json(
        "/-/all",
        &json!({"_updated": 1000, "a": {"name": "a", "v": 1}, "b": {"name": "b"}}),
    );
    registry.set_json(
        "/-/all/since?stale=update_after&startkey=1000",
        &json!({"_updated": 2000, "a": {"name": "a", "v": 2}, "c": {"name": "c"}}),
    );
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let index = update_index(service.registry(), Duration::ZERO).await.unwrap();
    assert_eq!(index["_updated"], 1000);
    assert_eq!(index["a"]["v"], 1);
    assert_eq!(registry.hits("/-/all"), 1);

    // Fresh enough: served without a request
    update_index(service.registry(), Duration::from_secs(600)).await.unwrap();
    assert_eq!(registry.hits("/-/all"), 1);

    let sidecar = service
        .registry()
        .sidecar_path(&registry.url("/-/all"))
        .unwrap();
    age(&sidecar, 120);

    let index = update_index(service.registry(), Duration::ZERO).await.unwrap();
    assert_eq!(index["_updated"], 2000);
    assert_eq!(index["a"]["v"], 2);
    assert_eq!(index["b"]["name"], "b");
    assert_eq!(index["c"]["name"], "c");
    assert_eq!(registry.hits("/-/all"), 1);
    assert_eq!(
        registry.hits("/-/all/since?stale=update_after&startkey=1000"),
        1
    );
}

#[tokio::test]
async fn test_corrupt_index_is_refetched() {
    let registry = MockRegistry::start().await;
    registry.set_json("/-/all", &json!({"_updated": 5, "a": {"name": "a"}}));
    let dir = tempdir().unwrap();
    let service = registry.service(dir.path());

    let sidecar = service
        .registry()
        .sidecar_path(&registry.url("/-/all"))
        .unwrap();
    std::fs::create_dir_all(sidecar.parent().unwrap()).unwrap();
    std::fs::write(&sidecar, "{broken").unwrap();

    let index = update_index(service.registry(), Duration::ZERO).await.unwrap();
    assert_eq!(index["a"]["name"], "a");
    assert_eq!(registry.hits("/-/all"), 1);
}
