//! Image cache garbage collection

use std::sync::Arc;

use anyhow::Result;

use crate::services::{ImageCacheManager, PurgeStats};

/// Remove cached images older than `max_age_days`
pub async fn cleanup_images(cache: Arc<ImageCacheManager>, max_age_days: u64) -> Result<PurgeStats> {
    let stats = cache.cleanup_older_than(max_age_days).await?;

    tracing::info!(
        deleted = stats.deleted,
        freed_bytes = stats.freed_bytes,
        "Image cache cleanup completed"
    );
    Ok(stats)
}
