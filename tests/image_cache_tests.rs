//! Integration tests for the image cache against a local HTTP server

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use media_sync::services::{ImageCacheConfig, ImageCacheManager};

// ============================================================================
// Test server
// ============================================================================

#[derive(Default)]
struct ServerStats {
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

async fn serve_image(
    State(stats): State<Arc<ServerStats>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Vec<u8>, StatusCode> {
    stats.requests.fetch_add(1, Ordering::SeqCst);
    if name == "missing" {
        return Err(StatusCode::NOT_FOUND);
    }
    if name == "private" && headers.get("x-plex-token").is_none() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let current = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_in_flight.fetch_max(current, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    stats.in_flight.fetch_sub(1, Ordering::SeqCst);

    Ok(format!("image:{}", name).into_bytes())
}

async fn start_server() -> (String, Arc<ServerStats>) {
    let stats = Arc::new(ServerStats::default());
    let app = Router::new()
        .route("/images/{name}", get(serve_image))
        .with_state(stats.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), stats)
}

fn cache(dir: &TempDir, permits: usize) -> Arc<ImageCacheManager> {
    let config = ImageCacheConfig {
        max_concurrent_downloads: permits,
        ..ImageCacheConfig::new(dir.path())
    };
    Arc::new(ImageCacheManager::new(config, reqwest::Client::new()))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_download_then_serve_from_disk() {
    let (base, stats) = start_server().await;
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, 5);
    let url = format!("{}/images/poster", base);

    let name = cache.cache_image("plex-1", "603", &url, None).await;
    assert_eq!(name.as_deref(), Some("603.jpg"));

    let path = cache.get_image("plex-1", "603").await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"image:poster");

    // cached: no second request
    let again = cache.cache_image("plex-1", "603", &url, None).await;
    assert_eq!(again.as_deref(), Some("603.jpg"));
    assert_eq!(stats.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failures_return_none() {
    let (base, _) = start_server().await;
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, 5);

    let missing = cache
        .cache_image("plex-1", "1", &format!("{}/images/missing", base), None)
        .await;
    assert_eq!(missing, None);
    assert!(!cache.is_cached("plex-1", "1").await);

    let unreachable = cache
        .cache_image("plex-1", "2", "http://127.0.0.1:9/images/x", None)
        .await;
    assert_eq!(unreachable, None);
}

#[tokio::test]
async fn test_auth_headers_are_forwarded() {
    let (base, _) = start_server().await;
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, 5);
    let url = format!("{}/images/private", base);

    assert_eq!(cache.cache_image("plex-1", "p", &url, None).await, None);

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("x-plex-token", "secret".parse().unwrap());
    assert!(cache.cache_image("plex-1", "p", &url, Some(&headers)).await.is_some());
}

#[tokio::test]
async fn test_downloads_respect_concurrency_limit() {
    let (base, stats) = start_server().await;
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, 2);

    let downloads = (0..8).map(|i| {
        let cache = cache.clone();
        let url = format!("{}/images/{}", base, i);
        async move { cache.cache_image("jf-1", &i.to_string(), &url, None).await }
    });
    let results = futures::future::join_all(downloads).await;
    assert!(results.iter().all(Option::is_some));

    assert_eq!(stats.requests.load(Ordering::SeqCst), 8);
    assert!(stats.max_in_flight.load(Ordering::SeqCst) <= 2);

    let purged = cache.purge_scope("jf-1").await.unwrap();
    assert_eq!(purged.deleted, 8);
}

#[tokio::test]
async fn test_large_images_are_capped() {
    let (base, _) = start_server().await;
    let dir = TempDir::new().unwrap();
    let config = ImageCacheConfig {
        large_cache_cap: 2,
        ..ImageCacheConfig::new(dir.path())
    };
    let cache = ImageCacheManager::new(config, reqwest::Client::new());

    for key in ["a", "b", "c"] {
        let url = format!("{}/images/{}", base, key);
        assert!(cache.cache_large_image("plex-1", key, &url, None).await.is_some());
    }

    let remaining = ["a", "b", "c"]
        .iter()
        .filter(|key| cache.large_image_path("plex-1", key).exists())
        .count();
    assert_eq!(remaining, 2);
    assert!(cache.get_large_image("plex-1", "c").await.is_some());
}
