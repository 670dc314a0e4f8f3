//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::services::image_cache::ImageCacheConfig;
use crate::services::rate_limiter::RetryConfig;
use crate::services::sync::SyncConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// SQLite database path or sqlite:// URL
    pub database_url: String,

    /// Root directory of the image cache
    pub image_cache_path: PathBuf,

    /// Cron expression for the periodic full sync
    pub sync_cron: String,

    /// Cron expression for the image cache cleanup
    pub image_cleanup_cron: String,

    /// Cached images untouched for longer than this are removed
    pub image_max_age_days: u64,

    /// Concurrent image downloads
    pub image_download_concurrency: usize,

    /// Large images kept per integration
    pub large_image_cache_cap: usize,

    /// Per-request timeout for provider calls
    pub provider_timeout: Duration,

    pub sync_max_retries: u32,

    pub progress_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "./data/media-sync.db".to_string());

        let image_cache_path = env::var("IMAGE_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_image_cache_path());

        Ok(Self {
            port: parse_var("PORT", 3001)?,

            database_url,

            image_cache_path,

            sync_cron: env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 */6 * * *".to_string()),

            image_cleanup_cron: env::var("IMAGE_CLEANUP_CRON")
                .unwrap_or_else(|_| "0 30 3 * * *".to_string()),

            image_max_age_days: parse_var("IMAGE_MAX_AGE_DAYS", 30)?,

            image_download_concurrency: parse_var("IMAGE_DOWNLOAD_CONCURRENCY", 5)?,

            large_image_cache_cap: parse_var("LARGE_IMAGE_CACHE_CAP", 100)?,

            provider_timeout: Duration::from_secs(parse_var("PROVIDER_TIMEOUT_SECS", 30)?),

            sync_max_retries: parse_var("SYNC_MAX_RETRIES", 2)?,

            progress_interval: Duration::from_millis(parse_var("PROGRESS_INTERVAL_MS", 150)?),
        })
    }

    pub fn image_cache(&self) -> ImageCacheConfig {
        ImageCacheConfig {
            max_concurrent_downloads: self.image_download_concurrency.max(1),
            large_cache_cap: self.large_image_cache_cap,
            ..ImageCacheConfig::new(&self.image_cache_path)
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            retry: RetryConfig {
                max_retries: self.sync_max_retries,
                ..Default::default()
            },
            progress_interval: self.progress_interval,
            ..Default::default()
        }
    }
}

/// `<user cache dir>/media-sync/images`, or `./data/images` when there is none
fn default_image_cache_path() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("media-sync").join("images"))
        .unwrap_or_else(|| PathBuf::from("./data/images"))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: '{}'", name, value)),
        Err(_) => Ok(default),
    }
}
