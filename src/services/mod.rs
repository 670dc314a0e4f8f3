//! Sync services: providers, indexing, image caching and orchestration

pub mod events;
pub mod image_cache;
pub mod indexer;
pub mod providers;
pub mod rate_limiter;
pub mod recent;
pub mod sync;

pub use events::{BroadcastSink, EventSink, SyncEvent};
pub use image_cache::{ImageCacheConfig, ImageCacheManager, PurgeStats};
pub use indexer::Indexer;
pub use providers::{HttpProviderFactory, ProviderError, ProviderFactory, ProviderSyncStrategy};
pub use rate_limiter::{RateLimitConfig, RateLimitedClient, RetryConfig};
pub use recent::RecentRefresher;
pub use sync::{PurgeResult, StartSyncResponse, SyncConfig, SyncService, SyncStatusView};
