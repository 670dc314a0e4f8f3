//! Library sync orchestration
//!
//! [SyncService] owns the per-integration sync lifecycle:
//! - at most one live run per integration, enforced by [SyncRegistry]
//! - runs execute in a detached task; `start_full_sync` returns immediately
//! - cancellation is cooperative, checked before every page and every item
//! - every run ends with a persisted terminal state, even if the task panics

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::db::sqlite_helpers::now_unix;
use crate::db::{IntegrationRecord, SyncState};
use crate::media::ExternalId;
use crate::services::events::{EventSink, ProgressThrottle, SyncEvent};
use crate::services::image_cache::ImageCacheManager;
use crate::services::indexer::Indexer;
use crate::services::providers::{PageToken, ProviderFactory, ProviderSyncStrategy, Section};
use crate::services::rate_limiter::{RetryConfig, retry_async};
use crate::services::recent::RecentRefresher;

/// Error recorded for runs that were live when the process stopped
pub const INTERRUPTED_MESSAGE: &str = "Sync interrupted by server restart";

/// Tunables for sync runs
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub retry: RetryConfig,
    /// Minimum gap between progress events
    pub progress_interval: Duration,
    /// How long a purge waits for a cancelled run to wind down
    pub purge_wait: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            progress_interval: Duration::from_millis(150),
            purge_wait: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Active sync registry
// ============================================================================

struct ActiveSync {
    run_id: Uuid,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Handle for a registered run
#[derive(Clone)]
pub struct SyncTicket {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    /// Cancelled once the run has finalized and left the registry
    pub done: CancellationToken,
}

/// Process-local map of live runs. A present, non-cancelled entry is the only source
/// of truth for "sync in progress".
#[derive(Default)]
pub struct SyncRegistry {
    active: Mutex<HashMap<String, ActiveSync>>,
}

impl SyncRegistry {
    /// Register a new run, or `None` if a non-cancelled run already exists
    pub fn try_register(&self, integration_id: &str) -> Option<SyncTicket> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(integration_id) {
            if !existing.cancel.is_cancelled() {
                return None;
            }
        }

        let ticket = SyncTicket {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        active.insert(
            integration_id.to_string(),
            ActiveSync {
                run_id: ticket.run_id,
                cancel: ticket.cancel.clone(),
                done: ticket.done.clone(),
            },
        );
        Some(ticket)
    }

    /// Request cancellation. False when nothing live was running.
    pub fn cancel(&self, integration_id: &str) -> bool {
        let active = self.active.lock();
        match active.get(integration_id) {
            Some(entry) if !entry.cancel.is_cancelled() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, integration_id: &str) -> bool {
        self.active
            .lock()
            .get(integration_id)
            .is_some_and(|entry| !entry.cancel.is_cancelled())
    }

    /// True while `run_id` is still the registered run for the integration
    pub fn is_current(&self, integration_id: &str, run_id: Uuid) -> bool {
        self.active
            .lock()
            .get(integration_id)
            .is_some_and(|entry| entry.run_id == run_id)
    }

    /// Completion signal of the registered run, cancelled or not
    pub fn done_signal(&self, integration_id: &str) -> Option<CancellationToken> {
        self.active
            .lock()
            .get(integration_id)
            .map(|entry| entry.done.clone())
    }

    /// Remove the entry if it still belongs to `run_id`
    pub fn release(&self, integration_id: &str, run_id: Uuid) {
        let mut active = self.active.lock();
        if active
            .get(integration_id)
            .is_some_and(|entry| entry.run_id == run_id)
        {
            active.remove(integration_id);
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.cancel.is_cancelled())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl StartSyncResponse {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Best-known sync status for an integration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusView {
    pub integration_id: String,
    pub state: SyncState,
    pub total_items: i64,
    pub indexed_items: i64,
    pub last_sync_started: Option<i64>,
    pub last_sync_completed: Option<i64>,
    pub error_message: Option<String>,
    /// A run is live in this process
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResult {
    pub deleted_items: u64,
    pub deleted_images: u64,
    pub freed_bytes: u64,
}

#[derive(Debug)]
enum SyncOutcome {
    Cancelled,
    Completed {
        total: u64,
        failed_sections: Vec<String>,
    },
    Failed(String),
}

// ============================================================================
// Service
// ============================================================================

pub struct SyncService {
    db: Database,
    providers: Arc<dyn ProviderFactory>,
    indexer: Indexer,
    images: Option<Arc<ImageCacheManager>>,
    refresher: RecentRefresher,
    events: Arc<dyn EventSink>,
    registry: SyncRegistry,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(
        db: Database,
        providers: Arc<dyn ProviderFactory>,
        images: Option<Arc<ImageCacheManager>>,
        events: Arc<dyn EventSink>,
        config: SyncConfig,
    ) -> Self {
        let indexer = Indexer::new(db.clone(), images.clone());
        let refresher =
            RecentRefresher::new(Arc::clone(&providers), indexer.clone(), images.is_some());
        Self {
            db,
            providers,
            indexer,
            images,
            refresher,
            events,
            registry: SyncRegistry::default(),
            config,
        }
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Start a full sync in the background.
    ///
    /// Rejected when the integration is unknown, its provider type has no strategy, or a
    /// run is already live.
    pub async fn start_full_sync(self: &Arc<Self>, integration_id: &str) -> Result<StartSyncResponse> {
        let Some(integration) = self.db.integrations().get(integration_id).await? else {
            return Ok(StartSyncResponse::rejected("Integration not found"));
        };
        let Some(strategy) = self.providers.strategy_for(&integration)? else {
            return Ok(StartSyncResponse::rejected(format!(
                "No sync strategy for provider type '{}'",
                integration.provider_type
            )));
        };
        let Some(ticket) = self.registry.try_register(integration_id) else {
            return Ok(StartSyncResponse::rejected("Sync already in progress"));
        };

        if let Err(e) = self
            .db
            .sync_status()
            .mark_started(integration_id, now_unix())
            .await
        {
            self.registry.release(integration_id, ticket.run_id);
            ticket.done.cancel();
            return Err(e.context("Failed to mark sync as started"));
        }

        info!(integration_id = %integration_id, run_id = %ticket.run_id, "Library sync started");
        self.events.emit(SyncEvent::Started {
            integration_id: integration_id.to_string(),
        });

        let service = Arc::clone(self);
        let integration_id = integration_id.to_string();
        tokio::spawn(async move {
            service.supervise(integration_id, strategy, ticket).await;
        });

        Ok(StartSyncResponse::accepted())
    }

    /// Run the sync in a nested task so a panic becomes a persisted error
    async fn supervise(
        self: Arc<Self>,
        integration_id: String,
        strategy: Arc<dyn ProviderSyncStrategy>,
        ticket: SyncTicket,
    ) {
        let indexed = Arc::new(AtomicU64::new(0));

        let run = tokio::spawn({
            let service = Arc::clone(&self);
            let integration_id = integration_id.clone();
            let cancel = ticket.cancel.clone();
            let indexed = Arc::clone(&indexed);
            async move {
                service
                    .run_full_sync(&integration_id, strategy, &cancel, &indexed)
                    .await
            }
        });

        let outcome = match run.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => SyncOutcome::Failed(format!("{:#}", e)),
            Err(join_error) => SyncOutcome::Failed(format!("Sync task aborted: {}", join_error)),
        };

        self.finalize(
            &integration_id,
            ticket.run_id,
            outcome,
            indexed.load(Ordering::SeqCst),
        )
        .await;
        self.registry.release(&integration_id, ticket.run_id);
        ticket.done.cancel();
    }

    async fn run_full_sync(
        &self,
        integration_id: &str,
        strategy: Arc<dyn ProviderSyncStrategy>,
        cancel: &CancellationToken,
        indexed: &AtomicU64,
    ) -> Result<SyncOutcome> {
        let retry = &self.config.retry;
        let status = self.db.sync_status();

        // 1. Enumerate sections. Failure here fails the whole run.
        let sections = retry_async(|| strategy.list_sections(), retry, "list_sections")
            .await
            .map_err(|e| anyhow!("Failed to list library sections: {}", e))?;
        let sections: Vec<Section> = sections.into_iter().filter(|s| s.is_syncable()).collect();
        debug!(integration_id = %integration_id, sections = sections.len(), "Enumerated library sections");

        // 2. Count items per section
        let mut failed_sections: Vec<String> = Vec::new();
        let mut planned: Vec<Section> = Vec::new();
        let mut total: u64 = 0;
        for section in sections {
            if cancel.is_cancelled() {
                return Ok(SyncOutcome::Cancelled);
            }
            let counted = retry_async(|| strategy.count_items(&section), retry, "count_items").await;
            match counted {
                Ok(count) => {
                    total += count;
                    planned.push(section);
                }
                Err(e) => {
                    warn!(integration_id = %integration_id, section = %section.title, error = %e, "Failed to count section");
                    failed_sections.push(format!("{} ({})", section.title, e));
                }
            }
        }
        status.set_total(integration_id, total as i64).await?;

        // 3. Clean slate
        let removed = self
            .db
            .media_items()
            .delete_by_integration(integration_id)
            .await
            .context("Failed to clear previous library snapshot")?;
        debug!(integration_id = %integration_id, removed, "Cleared previous items");

        // 4. Page through each section
        let image_source = self.images.is_some().then(|| strategy.image_source());
        let mut throttle = ProgressThrottle::new(self.config.progress_interval);

        'sections: for section in &planned {
            let mut token = PageToken::start();
            loop {
                if cancel.is_cancelled() {
                    return Ok(SyncOutcome::Cancelled);
                }

                let page = match retry_async(
                    || strategy.fetch_page(section, token),
                    retry,
                    "fetch_page",
                )
                .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(
                            integration_id = %integration_id,
                            section = %section.title,
                            offset = token.offset(),
                            error = %e,
                            "Section failed, continuing with remaining sections"
                        );
                        failed_sections.push(format!("{} ({})", section.title, e));
                        continue 'sections;
                    }
                };

                for raw in page.items {
                    if cancel.is_cancelled() {
                        return Ok(SyncOutcome::Cancelled);
                    }
                    let stored = self
                        .indexer
                        .index_item(integration_id, &section.key, raw, image_source.as_ref())
                        .await?;
                    if stored.is_none() {
                        continue;
                    }

                    let count = indexed.fetch_add(1, Ordering::SeqCst) + 1;
                    if throttle.should_emit() {
                        status.update_progress(integration_id, count as i64).await?;
                        self.events.emit(SyncEvent::Progress {
                            integration_id: integration_id.to_string(),
                            indexed: count,
                            total,
                            section: section.title.clone(),
                        });
                    }
                }

                match page.next {
                    Some(next) => token = next,
                    None => break,
                }
            }
        }

        Ok(SyncOutcome::Completed {
            total,
            failed_sections,
        })
    }

    async fn finalize(&self, integration_id: &str, run_id: Uuid, outcome: SyncOutcome, indexed: u64) {
        if !self.registry.is_current(integration_id, run_id) {
            warn!(integration_id = %integration_id, run_id = %run_id, "Run was superseded, skipping finalization");
            return;
        }

        let integration = integration_id.to_string();
        let (state, error_message, completed_at, event) = match outcome {
            SyncOutcome::Cancelled => {
                info!(integration_id = %integration_id, indexed, "Library sync cancelled");
                (
                    SyncState::Idle,
                    None,
                    None,
                    SyncEvent::Cancelled {
                        integration_id: integration,
                        indexed,
                    },
                )
            }
            SyncOutcome::Completed {
                total,
                failed_sections,
            } => {
                let error_message = (!failed_sections.is_empty())
                    .then(|| format!("Failed sections: {}", failed_sections.join("; ")));
                info!(
                    integration_id = %integration_id,
                    indexed,
                    total,
                    failed_sections = failed_sections.len(),
                    "Library sync completed"
                );
                (
                    SyncState::Completed,
                    error_message.clone(),
                    Some(now_unix()),
                    SyncEvent::Completed {
                        integration_id: integration,
                        indexed,
                        total,
                        error_message,
                    },
                )
            }
            SyncOutcome::Failed(error) => {
                error!(integration_id = %integration_id, error = %error, "Library sync failed");
                (
                    SyncState::Error,
                    Some(error.clone()),
                    None,
                    SyncEvent::Failed {
                        integration_id: integration,
                        error,
                    },
                )
            }
        };

        if let Err(e) = self
            .db
            .sync_status()
            .finish(
                integration_id,
                state,
                Some(indexed as i64),
                error_message.as_deref(),
                completed_at,
            )
            .await
        {
            error!(integration_id = %integration_id, error = %e, "Failed to persist sync result");
        }
        self.events.emit(event);
    }

    /// Request cancellation of a live run
    pub fn cancel_sync(&self, integration_id: &str) -> bool {
        let cancelled = self.registry.cancel(integration_id);
        if cancelled {
            info!(integration_id = %integration_id, "Library sync cancellation requested");
        }
        cancelled
    }

    pub fn is_syncing(&self, integration_id: &str) -> bool {
        self.registry.is_active(integration_id)
    }

    /// Wait until the registered run (if any) has finalized. False on timeout.
    pub async fn wait_for_idle(&self, integration_id: &str, timeout: Duration) -> bool {
        match self.registry.done_signal(integration_id) {
            Some(done) => tokio::time::timeout(timeout, done.cancelled())
                .await
                .is_ok(),
            None => true,
        }
    }

    /// Persisted status merged with live registry state; `idle` when never synced
    pub async fn get_status(&self, integration_id: &str) -> Result<SyncStatusView> {
        let record = self.db.sync_status().get(integration_id).await?;
        let active = self.registry.is_active(integration_id);

        Ok(match record {
            Some(record) => SyncStatusView {
                state: record.sync_state(),
                integration_id: record.integration_instance_id,
                total_items: record.total_items,
                indexed_items: record.indexed_items,
                last_sync_started: record.last_sync_started,
                last_sync_completed: record.last_sync_completed,
                error_message: record.error_message,
                active,
            },
            None => SyncStatusView {
                integration_id: integration_id.to_string(),
                state: SyncState::Idle,
                total_items: 0,
                indexed_items: 0,
                last_sync_started: None,
                last_sync_completed: None,
                error_message: None,
                active,
            },
        })
    }

    /// Remove everything synced for an integration: items, status and cached images.
    /// A live run is cancelled and given time to stop first.
    pub async fn purge_integration_data(&self, integration_id: &str) -> Result<PurgeResult> {
        if self.registry.cancel(integration_id)
            && !self.wait_for_idle(integration_id, self.config.purge_wait).await
        {
            warn!(integration_id = %integration_id, "Sync did not stop in time, purging anyway");
        }

        let deleted_items = self
            .db
            .media_items()
            .delete_by_integration(integration_id)
            .await?;
        self.db.sync_status().delete(integration_id).await?;

        let mut result = PurgeResult {
            deleted_items,
            ..Default::default()
        };
        if let Some(images) = &self.images {
            match images.purge_scope(integration_id).await {
                Ok(stats) => {
                    result.deleted_images = stats.deleted;
                    result.freed_bytes = stats.freed_bytes;
                }
                Err(e) => {
                    warn!(integration_id = %integration_id, error = %e, "Failed to purge cached images")
                }
            }
        }

        info!(
            integration_id = %integration_id,
            deleted_items = result.deleted_items,
            deleted_images = result.deleted_images,
            "Purged integration library data"
        );
        Ok(result)
    }

    /// Toggle library sync for an integration. Disabling purges everything synced for it.
    pub async fn set_library_sync_enabled(
        &self,
        integration_id: &str,
        enabled: bool,
    ) -> Result<Option<PurgeResult>> {
        let updated = self
            .db
            .integrations()
            .set_library_sync_enabled(integration_id, enabled)
            .await?;
        if !updated {
            anyhow::bail!("Integration not found: {}", integration_id);
        }
        if enabled {
            return Ok(None);
        }
        self.purge_integration_data(integration_id).await.map(Some)
    }

    /// Reset persisted `syncing` rows that have no live run. Called at startup.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let status = self.db.sync_status();
        let mut recovered = 0;
        for integration_id in status.list_syncing().await? {
            if self.registry.is_active(&integration_id) {
                continue;
            }
            status
                .finish(
                    &integration_id,
                    SyncState::Error,
                    None,
                    Some(INTERRUPTED_MESSAGE),
                    None,
                )
                .await?;
            warn!(integration_id = %integration_id, "Reset sync interrupted by restart");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Start a full sync for every integration with library sync enabled
    pub async fn start_all_enabled(self: &Arc<Self>) -> Result<Vec<(String, StartSyncResponse)>> {
        let integrations = self.db.integrations().list_sync_enabled().await?;
        let mut results = Vec::with_capacity(integrations.len());

        for integration in integrations {
            let response = match self.start_full_sync(&integration.id).await {
                Ok(response) => response,
                Err(e) => StartSyncResponse::rejected(format!("{:#}", e)),
            };
            if let Some(reason) = &response.reason {
                debug!(integration_id = %integration.id, reason = %reason, "Scheduled sync not started");
            }
            results.push((integration.id, response));
        }

        Ok(results)
    }

    /// Large artwork for one indexed item, fetched from its provider on first use and
    /// served from the LRU-bounded cache afterwards.
    ///
    /// `None` when there is no image cache, the item is unknown or has no artwork, or
    /// the download fails.
    pub async fn detail_image(
        &self,
        integration_id: &str,
        external_key: &str,
    ) -> Result<Option<PathBuf>> {
        let Some(images) = &self.images else {
            return Ok(None);
        };
        if let Some(path) = images.get_large_image(integration_id, external_key).await {
            return Ok(Some(path));
        }

        let Some(item) = self.db.media_items().get(integration_id, external_key).await? else {
            return Ok(None);
        };
        let Some(art) = item.art_path.or(item.thumb_path) else {
            return Ok(None);
        };
        let Some(integration) = self.db.integrations().get(integration_id).await? else {
            return Ok(None);
        };
        let Some(strategy) = self.providers.strategy_for(&integration)? else {
            return Ok(None);
        };

        let source = strategy.image_source();
        let url = source.resolve(&art);
        Ok(images
            .cache_large_image(integration_id, external_key, &url, source.headers_for(&url))
            .await)
    }

    /// Targeted refresh of recently added items carrying any of `targets`
    pub async fn index_matching_recent(
        &self,
        targets: &HashSet<ExternalId>,
        integrations: &[IntegrationRecord],
    ) -> HashSet<ExternalId> {
        self.refresher.index_matching(targets, integrations).await
    }
}
