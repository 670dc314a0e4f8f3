//! On-disk artwork cache
//!
//! Layout: `<root>/<scope>/<key>.jpg` for thumbnails and `<root>/<scope>/large/<key>.jpg`
//! for detail-view images. A scope is usually an integration id. Scope and key are
//! percent-encoded before they touch the filesystem, so distinct values never share a path.
//!
//! Downloads share one semaphore, so bulk indexing never has more than N requests in
//! flight. Large images are LRU-bounded per scope using the file access time.
//!
//! Each scope has a generation token. Purging a scope cancels its generation, and a
//! download only writes if its generation is still live, so nothing queued before a
//! purge can repopulate the scope afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use filetime::FileTime;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IMAGE_EXTENSION: &str = "jpg";
const LARGE_DIR: &str = "large";

/// Configuration for the image cache
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    pub root: PathBuf,
    /// Simultaneous downloads across the whole process
    pub max_concurrent_downloads: usize,
    /// Large images kept per scope
    pub large_cache_cap: usize,
}

impl ImageCacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_concurrent_downloads: 5,
            large_cache_cap: 100,
        }
    }
}

/// Files removed and bytes reclaimed by a purge or cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeStats {
    pub deleted: u64,
    pub freed_bytes: u64,
}

pub struct ImageCacheManager {
    root: PathBuf,
    client: Client,
    downloads: Arc<Semaphore>,
    large_cap: usize,
    /// Serializes store + evict for large images
    large_lock: Mutex<()>,
    /// Live generation per encoded scope
    generations: parking_lot::Mutex<HashMap<String, CancellationToken>>,
    /// Writes hold this shared; a purge holds it exclusively
    write_gate: RwLock<()>,
}

/// Filesystem-safe, injective name for a scope or key.
///
/// Form encoding leaves only `[A-Za-z0-9*-._]` literal. A leading dot is escaped so
/// no component is hidden or `.`/`..`, and the empty string becomes a lone `%`, which
/// no other input produces.
fn encode_component(value: &str) -> String {
    if value.is_empty() {
        return "%".to_string();
    }
    let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded,
    }
}

impl ImageCacheManager {
    pub fn new(config: ImageCacheConfig, client: Client) -> Self {
        Self {
            root: config.root,
            client,
            downloads: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            large_cap: config.large_cache_cap.max(1),
            large_lock: Mutex::new(()),
            generations: parking_lot::Mutex::new(HashMap::new()),
            write_gate: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scope: &str) -> PathBuf {
        self.root.join(encode_component(scope))
    }

    fn file_name(key: &str) -> String {
        format!("{}.{}", encode_component(key), IMAGE_EXTENSION)
    }

    fn generation(&self, scope: &str) -> CancellationToken {
        self.generations
            .lock()
            .entry(encode_component(scope))
            .or_default()
            .clone()
    }

    /// Path of a cached thumbnail, whether or not it exists
    pub fn image_path(&self, scope: &str, key: &str) -> PathBuf {
        self.scope_dir(scope).join(Self::file_name(key))
    }

    /// Path of a cached large image, whether or not it exists
    pub fn large_image_path(&self, scope: &str, key: &str) -> PathBuf {
        self.scope_dir(scope).join(LARGE_DIR).join(Self::file_name(key))
    }

    pub async fn is_cached(&self, scope: &str, key: &str) -> bool {
        tokio::fs::try_exists(self.image_path(scope, key))
            .await
            .unwrap_or(false)
    }

    /// Download a thumbnail in the background. The download belongs to the scope's
    /// current generation and is dropped if the scope is purged first.
    pub fn queue_image(
        self: &Arc<Self>,
        scope: &str,
        key: &str,
        source_url: String,
        headers: Option<HeaderMap>,
    ) {
        let generation = self.generation(scope);
        let cache = Arc::clone(self);
        let scope = scope.to_string();
        let key = key.to_string();

        tokio::spawn(async move {
            cache
                .cache_image_in(&scope, &key, &source_url, headers.as_ref(), &generation)
                .await;
        });
    }

    /// Download a thumbnail unless it is already cached.
    ///
    /// Returns the cached file name, or `None` on any failure (logged, never propagated).
    pub async fn cache_image(
        &self,
        scope: &str,
        key: &str,
        source_url: &str,
        headers: Option<&HeaderMap>,
    ) -> Option<String> {
        let generation = self.generation(scope);
        self.cache_image_in(scope, key, source_url, headers, &generation)
            .await
    }

    async fn cache_image_in(
        &self,
        scope: &str,
        key: &str,
        source_url: &str,
        headers: Option<&HeaderMap>,
        generation: &CancellationToken,
    ) -> Option<String> {
        let path = self.image_path(scope, key);
        let file_name = Self::file_name(key);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some(file_name);
        }

        match self.download_to(&path, source_url, headers, generation).await {
            Ok(true) => Some(file_name),
            Ok(false) => {
                debug!(scope = %scope, key = %key, "Image download dropped by purge");
                None
            }
            Err(e) => {
                warn!(scope = %scope, key = %key, url = %source_url, error = %e, "Failed to cache image");
                None
            }
        }
    }

    /// Cached thumbnail path, if present
    pub async fn get_image(&self, scope: &str, key: &str) -> Option<PathBuf> {
        let path = self.image_path(scope, key);
        tokio::fs::try_exists(&path)
            .await
            .unwrap_or(false)
            .then_some(path)
    }

    /// Download a large image unless it is already cached, then enforce the LRU cap.
    /// A hit counts as an access. Returns the cached path.
    pub async fn cache_large_image(
        &self,
        scope: &str,
        key: &str,
        source_url: &str,
        headers: Option<&HeaderMap>,
    ) -> Option<PathBuf> {
        if let Some(path) = self.get_large_image(scope, key).await {
            return Some(path);
        }

        let generation = self.generation(scope);
        let bytes = match self.fetch_bytes(source_url, headers, Some(&generation)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(scope = %scope, key = %key, url = %source_url, error = %e, "Failed to fetch large image");
                return None;
            }
        };

        match self.store_large(scope, key, &bytes, &generation).await {
            Ok(path) => path,
            Err(e) => {
                warn!(scope = %scope, key = %key, error = %e, "Failed to store large image");
                None
            }
        }
    }

    /// Cached large image path, touching its access time on a hit
    pub async fn get_large_image(&self, scope: &str, key: &str) -> Option<PathBuf> {
        let path = self.large_image_path(scope, key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return None;
        }
        if let Err(e) = touch_access_time(&path).await {
            debug!(path = %path.display(), error = %e, "Failed to touch cached image");
        }
        Some(path)
    }

    /// Write a large image and evict the least recently accessed entries beyond the cap
    pub async fn store_large_bytes(&self, scope: &str, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        let generation = self.generation(scope);
        self.store_large(scope, key, bytes, &generation)
            .await?
            .ok_or_else(|| anyhow!("Scope {} was purged during the write", scope))
    }

    /// `None` when the generation was purged before the write
    async fn store_large(
        &self,
        scope: &str,
        key: &str,
        bytes: &[u8],
        generation: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let _guard = self.large_lock.lock().await;
        let _gate = self.write_gate.read().await;
        if generation.is_cancelled() {
            return Ok(None);
        }
        let path = self.large_image_path(scope, key);
        write_atomic(&path, bytes).await?;
        touch_access_time(&path).await?;

        let evicted = self.evict_large(scope).await?;
        if evicted > 0 {
            debug!(scope = %scope, evicted, "Evicted large images");
        }
        Ok(Some(path))
    }

    async fn evict_large(&self, scope: &str) -> Result<usize> {
        let dir = self.scope_dir(scope).join(LARGE_DIR);
        let mut entries: Vec<(SystemTime, String, PathBuf)> = Vec::new();

        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let accessed = metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((
                accessed,
                entry.file_name().to_string_lossy().into_owned(),
                entry.path(),
            ));
        }

        if entries.len() <= self.large_cap {
            return Ok(0);
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let excess = entries.len() - self.large_cap;
        for (_, _, path) in entries.into_iter().take(excess) {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to evict {}", path.display()))?;
        }
        Ok(excess)
    }

    /// Remove everything cached for a scope. Downloads queued for the scope before this
    /// call never write.
    pub async fn purge_scope(&self, scope: &str) -> Result<PurgeStats> {
        let _gate = self.write_gate.write().await;
        let retired = self.generations.lock().remove(&encode_component(scope));
        if let Some(generation) = retired {
            generation.cancel();
        }

        let dir = self.scope_dir(scope);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(PurgeStats::default());
        }

        let mut stats = PurgeStats::default();
        for (path, metadata) in list_files(&dir).await? {
            debug!(path = %path.display(), "Purging cached image");
            stats.deleted += 1;
            stats.freed_bytes += metadata.len();
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to remove {}", dir.display()))?;

        info!(scope = %scope, deleted = stats.deleted, freed_bytes = stats.freed_bytes, "Purged image cache scope");
        Ok(stats)
    }

    /// Remove cached files last written more than `days` ago, across all scopes
    pub async fn cleanup_older_than(&self, days: u64) -> Result<PurgeStats> {
        let mut stats = PurgeStats::default();
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(stats);
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for (path, metadata) in list_files(&self.root).await? {
            let modified = metadata.modified().unwrap_or(SystemTime::now());
            if modified >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    stats.deleted += 1;
                    stats.freed_bytes += metadata.len();
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale image"),
            }
        }

        info!(days, deleted = stats.deleted, freed_bytes = stats.freed_bytes, "Image cache cleanup complete");
        Ok(stats)
    }

    /// `None` when `generation` is cancelled before a permit is granted
    async fn fetch_bytes(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
        generation: Option<&CancellationToken>,
    ) -> Result<Option<Vec<u8>>> {
        let permit = match generation {
            Some(generation) => tokio::select! {
                _ = generation.cancelled() => return Ok(None),
                permit = self.downloads.acquire() => permit,
            },
            None => self.downloads.acquire().await,
        };
        let _permit = permit.map_err(|_| anyhow!("download semaphore closed"))?;

        let mut request = self.client.get(url);
        if let Some(headers) = headers {
            request = request.headers(headers.clone());
        }
        let response = request.send().await.context("Image request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Image request returned {}", response.status());
        }
        let bytes = response.bytes().await.context("Failed to read image body")?;
        if bytes.is_empty() {
            anyhow::bail!("Image response was empty");
        }
        Ok(Some(bytes.to_vec()))
    }

    /// False when the download was dropped because its generation was purged
    async fn download_to(
        &self,
        path: &Path,
        url: &str,
        headers: Option<&HeaderMap>,
        generation: &CancellationToken,
    ) -> Result<bool> {
        let Some(bytes) = self.fetch_bytes(url, headers, Some(generation)).await? else {
            return Ok(false);
        };

        let _gate = self.write_gate.read().await;
        if generation.is_cancelled() {
            return Ok(false);
        }
        // another caller may have finished the same image while we waited for a permit
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(true);
        }
        write_atomic(path, &bytes).await?;
        Ok(true)
    }
}

/// Write via a temp file and rename so readers never see a partial image
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("Image path has no parent: {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let tmp = parent.join(format!(".{}.part", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to move image into {}", path.display()));
    }
    Ok(())
}

async fn touch_access_time(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || filetime::set_file_atime(&path, FileTime::now()))
        .await
        .context("touch task panicked")??;
    Ok(())
}

/// Every regular file under `dir`, recursively
async fn list_files(dir: &Path) -> Result<Vec<(PathBuf, std::fs::Metadata)>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut read_dir = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("Failed to read {}", current.display()))?;
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                files.push((entry.path(), metadata));
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, cap: usize) -> ImageCacheManager {
        let config = ImageCacheConfig {
            root: dir.path().to_path_buf(),
            max_concurrent_downloads: 2,
            large_cache_cap: cap,
        };
        ImageCacheManager::new(config, Client::new())
    }

    fn set_atime(path: &Path, secs: i64) {
        filetime::set_file_atime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn test_paths_stay_inside_their_scope() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 3);

        let path = cache.image_path("plex-1", "../../etc/passwd");
        assert_eq!(path.parent().unwrap(), dir.path().join("plex-1"));

        let dotted = cache.image_path("..", "");
        assert_eq!(dotted, dir.path().join("%2E.").join("%.jpg"));
        assert_eq!(cache.image_path("plex-1", "603"), dir.path().join("plex-1").join("603.jpg"));
    }

    #[test]
    fn test_encoding_is_injective() {
        let values = ["jf1", "jf/1", "jf 1", "jf+1", "jf%2F1", ".jf1", "%2Ejf1", "", "%"];
        let encoded: std::collections::HashSet<String> =
            values.iter().map(|v| encode_component(v)).collect();
        assert_eq!(encoded.len(), values.len());
    }

    #[tokio::test]
    async fn test_purge_does_not_touch_lookalike_scope() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 10);

        cache.store_large_bytes("jf1", "a", b"keep").await.unwrap();
        cache.store_large_bytes("jf/1", "a", b"drop").await.unwrap();

        let stats = cache.purge_scope("jf/1").await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(cache.get_large_image("jf1", "a").await.is_some());
    }

    #[tokio::test]
    async fn test_purge_retires_pending_writes() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 10);

        let stale = cache.generation("jf-1");
        cache.purge_scope("jf-1").await.unwrap();
        assert!(stale.is_cancelled());

        let dropped = cache.store_large("jf-1", "a", b"x", &stale).await.unwrap();
        assert_eq!(dropped, None);
        assert!(!cache.large_image_path("jf-1", "a").exists());

        // writes started after the purge use the new generation
        assert!(cache.store_large_bytes("jf-1", "a", b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 3);

        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let path = cache.store_large_bytes("s", key, b"img").await.unwrap();
            set_atime(&path, 1_000 + i as i64);
        }

        // "a" is the oldest; a hit makes it the most recent
        assert!(cache.get_large_image("s", "a").await.is_some());

        cache.store_large_bytes("s", "d", b"img").await.unwrap();

        assert!(cache.get_large_image("s", "b").await.is_none());
        assert!(cache.large_image_path("s", "a").exists());
        assert!(cache.large_image_path("s", "c").exists());
        assert!(cache.large_image_path("s", "d").exists());
    }

    #[tokio::test]
    async fn test_lru_cap_is_per_scope() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 1);

        cache.store_large_bytes("one", "a", b"x").await.unwrap();
        cache.store_large_bytes("two", "a", b"x").await.unwrap();

        assert!(cache.large_image_path("one", "a").exists());
        assert!(cache.large_image_path("two", "a").exists());
    }

    #[tokio::test]
    async fn test_purge_scope_counts_files_and_bytes() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 10);

        write_atomic(&cache.image_path("jf-1", "1"), b"12345").await.unwrap();
        write_atomic(&cache.image_path("jf-1", "2"), b"123").await.unwrap();
        cache.store_large_bytes("jf-1", "1", b"1234567890").await.unwrap();
        write_atomic(&cache.image_path("plex-1", "1"), b"keep").await.unwrap();

        let stats = cache.purge_scope("jf-1").await.unwrap();
        assert_eq!(
            stats,
            PurgeStats {
                deleted: 3,
                freed_bytes: 18
            }
        );
        assert!(!dir.path().join("jf-1").exists());
        assert!(cache.is_cached("plex-1", "1").await);

        assert_eq!(cache.purge_scope("jf-1").await.unwrap(), PurgeStats::default());
    }

    #[tokio::test]
    async fn test_cleanup_older_than() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 10);

        let old = cache.image_path("plex-1", "old");
        write_atomic(&old, b"old").await.unwrap();
        let forty_days_ago = FileTime::from_unix_time(
            chrono::Utc::now().timestamp() - 40 * 24 * 60 * 60,
            0,
        );
        filetime::set_file_mtime(&old, forty_days_ago).unwrap();
        write_atomic(&cache.image_path("plex-1", "new"), b"new").await.unwrap();

        let stats = cache.cleanup_older_than(30).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(!cache.is_cached("plex-1", "old").await);
        assert!(cache.is_cached("plex-1", "new").await);
    }

    #[tokio::test]
    async fn test_cache_image_short_circuits_when_present() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 10);
        write_atomic(&cache.image_path("plex-1", "603"), b"img").await.unwrap();

        // unreachable URL: a download attempt would fail
        let name = cache
            .cache_image("plex-1", "603", "http://127.0.0.1:9/nothing", None)
            .await;
        assert_eq!(name.as_deref(), Some("603.jpg"));
    }
}
