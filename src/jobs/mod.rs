//! Background job scheduling and workers

pub mod image_gc;
pub mod library_sync;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::Config;
use crate::services::{ImageCacheManager, SyncService};

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    config: &Config,
    sync_service: Arc<SyncService>,
    image_cache: Arc<ImageCacheManager>,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Full library sync of every enabled integration
    let sync_job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let service = sync_service.clone();
        Box::pin(async move {
            info!("Running scheduled library sync");
            if let Err(e) = library_sync::sync_all_enabled(service).await {
                tracing::error!("Library sync job error: {}", e);
            }
        })
    })?;
    scheduler.add(sync_job).await?;

    // Image cache cleanup
    let max_age_days = config.image_max_age_days;
    let gc_job = Job::new_async(config.image_cleanup_cron.as_str(), move |_uuid, _l| {
        let cache = image_cache.clone();
        Box::pin(async move {
            info!("Running image cache cleanup");
            if let Err(e) = image_gc::cleanup_images(cache, max_age_days).await {
                tracing::error!("Image GC error: {}", e);
            }
        })
    })?;
    scheduler.add(gc_job).await?;

    scheduler.start().await?;

    info!(
        sync_cron = %config.sync_cron,
        image_cleanup_cron = %config.image_cleanup_cron,
        "Job scheduler started"
    );
    Ok(scheduler)
}
