//! Targeted refresh from recently-added listings
//!
//! Given a handful of external ids that just became available somewhere, scan only
//! the newest [RECENT_LIMIT] items of each section and index the ones that match.
//! Calls are single-attempt: an integration that fails is logged and skipped.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::db::IntegrationRecord;
use crate::media::ExternalId;
use crate::services::indexer::Indexer;
use crate::services::providers::{ProviderFactory, RECENT_LIMIT};

pub struct RecentRefresher {
    providers: Arc<dyn ProviderFactory>,
    indexer: Indexer,
    cache_images: bool,
}

impl RecentRefresher {
    pub fn new(providers: Arc<dyn ProviderFactory>, indexer: Indexer, cache_images: bool) -> Self {
        Self {
            providers,
            indexer,
            cache_images,
        }
    }

    /// Index recently added items matching `targets`. Returns the ids that were found.
    pub async fn index_matching(
        &self,
        targets: &HashSet<ExternalId>,
        integrations: &[IntegrationRecord],
    ) -> HashSet<ExternalId> {
        let mut found = HashSet::new();
        if targets.is_empty() {
            return found;
        }

        for integration in integrations {
            if found.len() >= targets.len() {
                debug!("All requested ids found, stopping early");
                break;
            }
            if let Err(e) = self.refresh_integration(integration, targets, &mut found).await {
                warn!(
                    integration_id = %integration.id,
                    error = %e,
                    "Recently-added refresh failed, skipping integration"
                );
            }
        }

        info!(
            requested = targets.len(),
            found = found.len(),
            "Recently-added refresh complete"
        );
        found
    }

    async fn refresh_integration(
        &self,
        integration: &IntegrationRecord,
        targets: &HashSet<ExternalId>,
        found: &mut HashSet<ExternalId>,
    ) -> Result<()> {
        let Some(strategy) = self.providers.strategy_for(integration)? else {
            debug!(integration_id = %integration.id, provider_type = %integration.provider_type, "No strategy for integration");
            return Ok(());
        };
        let image_source = self.cache_images.then(|| strategy.image_source());

        let sections = strategy.list_sections().await?;
        for section in sections.iter().filter(|s| s.is_syncable()) {
            if found.len() >= targets.len() {
                break;
            }

            let items = match strategy.fetch_recent(section, RECENT_LIMIT).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(
                        integration_id = %integration.id,
                        section = %section.title,
                        error = %e,
                        "Failed to fetch recently added items"
                    );
                    continue;
                }
            };

            for raw in items {
                let ids = raw.external_ids();
                let matched: Vec<ExternalId> = targets
                    .iter()
                    .filter(|target| ids.matches(target))
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    continue;
                }

                let indexed = self
                    .indexer
                    .index_item(&integration.id, &section.key, raw, image_source.as_ref())
                    .await?;
                if let Some(item) = indexed {
                    debug!(
                        integration_id = %integration.id,
                        key = %item.external_key,
                        title = %item.title,
                        "Indexed recently added item"
                    );
                    found.extend(matched);
                }
            }
        }

        Ok(())
    }
}
