//! Periodic full sync of every sync-enabled integration

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::services::SyncService;

/// Kick off a full sync for each enabled integration. Integrations that are already
/// syncing are skipped by the orchestrator.
pub async fn sync_all_enabled(service: Arc<SyncService>) -> Result<usize> {
    let results = service.start_all_enabled().await?;
    let started = results.iter().filter(|(_, r)| r.accepted).count();

    info!(
        integrations = results.len(),
        started,
        "Scheduled library sync dispatched"
    );
    Ok(started)
}
