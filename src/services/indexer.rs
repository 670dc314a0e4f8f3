//! Indexer: raw provider items into the local store
//!
//! Normalizes each [RawItem], upserts it (the repository keeps the FTS index in step)
//! and hands the thumbnail to the image cache in the background. Provider auth headers
//! go only to the provider's own origin.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::db::Database;
use crate::media::CanonicalMediaItem;
use crate::services::image_cache::ImageCacheManager;
use crate::services::providers::{ImageSource, RawItem};

#[derive(Clone)]
pub struct Indexer {
    db: Database,
    images: Option<Arc<ImageCacheManager>>,
}

impl Indexer {
    pub fn new(db: Database, images: Option<Arc<ImageCacheManager>>) -> Self {
        Self { db, images }
    }

    /// Idempotently store one item. Returns `None` when the item's type is not modelled.
    ///
    /// Thumbnail caching never blocks or fails indexing.
    pub async fn index_item(
        &self,
        integration_id: &str,
        section_key: &str,
        raw: RawItem,
        image_source: Option<&ImageSource>,
    ) -> Result<Option<CanonicalMediaItem>> {
        let key = raw.key().to_string();
        let Some(item) = raw.into_canonical(integration_id, section_key) else {
            debug!(integration_id = %integration_id, key = %key, "Skipping unsupported item");
            return Ok(None);
        };

        self.db.media_items().upsert(&item).await?;

        if let Some(source) = image_source {
            self.queue_thumbnail(&item, source);
        }

        Ok(Some(item))
    }

    fn queue_thumbnail(&self, item: &CanonicalMediaItem, source: &ImageSource) {
        let (Some(cache), Some(thumb)) = (&self.images, &item.thumb_path) else {
            return;
        };

        let url = source.resolve(thumb);
        let headers = source.headers_for(&url).cloned();
        // failures are logged by the cache
        cache.queue_image(&item.integration_id, &item.external_key, url, headers);
    }
}
