//! Media-server sync strategies
//!
//! Each provider type (Plex, Jellyfin, Emby) implements [ProviderSyncStrategy]: list
//! library sections, count their items, fetch fixed-size pages by offset, and fetch
//! the most recently added items. Raw items are a closed [RawItem] union that maps
//! into [CanonicalMediaItem].

pub mod error;
pub mod jellyfin;
pub mod plex;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

pub use error::ProviderError;
pub use jellyfin::{JellyfinFlavor, JellyfinItem, JellyfinStrategy};
pub use plex::{PlexMetadata, PlexStrategy};

use crate::db::IntegrationRecord;
use crate::media::{CanonicalMediaItem, ExternalIds};
use crate::services::rate_limiter::{RateLimitConfig, RateLimitedClient};

/// Items requested per page during a full sync
pub const PAGE_SIZE: u32 = 500;

/// Items requested per section by the recently-added refresh
pub const RECENT_LIMIT: u32 = 20;

// ============================================================================
// Provider kinds and sections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Plex,
    Jellyfin,
    Emby,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Plex => "plex",
            ProviderKind::Jellyfin => "jellyfin",
            ProviderKind::Emby => "emby",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plex" => Ok(ProviderKind::Plex),
            "jellyfin" => Ok(ProviderKind::Jellyfin),
            "emby" => Ok(ProviderKind::Emby),
            other => Err(format!("unsupported provider type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Movie,
    Show,
    Other,
}

/// A provider-side library grouping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub key: String,
    pub title: String,
    pub kind: SectionKind,
}

impl Section {
    /// Only movie and show libraries are synced
    pub fn is_syncable(&self) -> bool {
        matches!(self.kind, SectionKind::Movie | SectionKind::Show)
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// Offset into a section's item list. Resuming from a token refetches that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken(u32);

impl PageToken {
    pub fn start() -> Self {
        PageToken(0)
    }

    pub fn at(offset: u32) -> Self {
        PageToken(offset)
    }

    pub fn offset(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<RawItem>,
    pub next: Option<PageToken>,
}

impl Page {
    /// Build a page fetched at `offset` from a section holding `total` items.
    ///
    /// An empty page always ends pagination, even if the reported total is larger.
    pub fn from_offset(items: Vec<RawItem>, offset: u32, total: u64) -> Self {
        let end = offset as u64 + items.len() as u64;
        let next = if !items.is_empty() && end < total {
            Some(PageToken(end as u32))
        } else {
            None
        };
        Page { items, next }
    }
}

/// Section total to paginate against. Without a reported total, a full page means
/// there may be more.
pub fn page_total(reported: Option<u64>, offset: u32, fetched: usize) -> u64 {
    reported.unwrap_or_else(|| {
        let seen = offset as u64 + fetched as u64;
        if fetched as u64 >= PAGE_SIZE as u64 {
            seen + 1
        } else {
            seen
        }
    })
}

// ============================================================================
// Raw items
// ============================================================================

/// Provider-native item as returned by a page or recent fetch
#[derive(Debug, Clone)]
pub enum RawItem {
    Plex(PlexMetadata),
    /// Jellyfin and Emby share a wire format
    Jellyfin(JellyfinItem),
}

impl RawItem {
    /// Provider-native item key
    pub fn key(&self) -> &str {
        match self {
            RawItem::Plex(item) => &item.rating_key,
            RawItem::Jellyfin(item) => &item.id,
        }
    }

    pub fn external_ids(&self) -> ExternalIds {
        match self {
            RawItem::Plex(item) => item.external_ids(),
            RawItem::Jellyfin(item) => item.external_ids(),
        }
    }

    /// Normalize into a canonical item. `None` for media types this crate does not model.
    pub fn into_canonical(
        self,
        integration_id: &str,
        section_key: &str,
    ) -> Option<CanonicalMediaItem> {
        match self {
            RawItem::Plex(item) => item.into_canonical(integration_id, section_key),
            RawItem::Jellyfin(item) => item.into_canonical(integration_id, section_key),
        }
    }
}

// ============================================================================
// Images
// ============================================================================

/// Where and how to fetch artwork paths reported by a provider
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub base_url: String,
    pub headers: HeaderMap,
}

impl ImageSource {
    /// Absolute URL for a provider image path
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Auth headers to send with `url`; only when it has the same origin as the server
    pub fn headers_for(&self, url: &str) -> Option<&HeaderMap> {
        let same_origin = match (Url::parse(&self.base_url), Url::parse(url)) {
            (Ok(base), Ok(target)) => base.origin() == target.origin(),
            _ => false,
        };
        same_origin.then_some(&self.headers)
    }
}

// ============================================================================
// Strategy trait
// ============================================================================

/// Paginated catalog access for one provider
#[async_trait]
pub trait ProviderSyncStrategy: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// All library sections, syncable or not
    async fn list_sections(&self) -> Result<Vec<Section>, ProviderError>;

    /// Total items in a section
    async fn count_items(&self, section: &Section) -> Result<u64, ProviderError>;

    /// One page of [PAGE_SIZE] items starting at `token`
    async fn fetch_page(&self, section: &Section, token: PageToken)
    -> Result<Page, ProviderError>;

    /// Newest `limit` items of a section, most recent first
    async fn fetch_recent(
        &self,
        section: &Section,
        limit: u32,
    ) -> Result<Vec<RawItem>, ProviderError>;

    /// Base URL and auth headers for artwork downloads
    fn image_source(&self) -> ImageSource;
}

/// Builds a strategy for a configured integration
pub trait ProviderFactory: Send + Sync {
    /// `Ok(None)` when the integration's provider type has no strategy
    fn strategy_for(
        &self,
        integration: &IntegrationRecord,
    ) -> anyhow::Result<Option<Arc<dyn ProviderSyncStrategy>>>;
}

/// Factory producing HTTP-backed strategies over one shared client
pub struct HttpProviderFactory {
    client: Client,
    rate_limit: RateLimitConfig,
}

impl HttpProviderFactory {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    fn http(&self, integration: &IntegrationRecord) -> RateLimitedClient {
        RateLimitedClient::new(&integration.id, self.client.clone(), self.rate_limit.clone())
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn strategy_for(
        &self,
        integration: &IntegrationRecord,
    ) -> anyhow::Result<Option<Arc<dyn ProviderSyncStrategy>>> {
        let Some(kind) = integration.kind() else {
            return Ok(None);
        };
        let token = integration.api_token.as_deref().unwrap_or_default();

        let strategy: Arc<dyn ProviderSyncStrategy> = match kind {
            ProviderKind::Plex => Arc::new(PlexStrategy::new(
                self.http(integration),
                &integration.base_url,
                token,
            )?),
            ProviderKind::Jellyfin | ProviderKind::Emby => {
                let flavor = if kind == ProviderKind::Emby {
                    JellyfinFlavor::Emby
                } else {
                    JellyfinFlavor::Jellyfin
                };
                Arc::new(JellyfinStrategy::new(
                    self.http(integration),
                    &integration.base_url,
                    token,
                    integration.user_id.clone(),
                    flavor,
                )?)
            }
        };

        Ok(Some(strategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integration(provider_type: &str) -> IntegrationRecord {
        IntegrationRecord {
            id: "int-1".to_string(),
            name: "Server".to_string(),
            provider_type: provider_type.to_string(),
            base_url: "http://127.0.0.1:8096/".to_string(),
            api_token: Some("secret".to_string()),
            user_id: None,
            library_sync_enabled: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_page_from_offset() {
        let items = |n: usize| vec![RawItem::Jellyfin(JellyfinItem::default()); n];

        let page = Page::from_offset(items(500), 0, 1200);
        assert_eq!(page.next, Some(PageToken::at(500)));

        let last = Page::from_offset(items(200), 1000, 1200);
        assert_eq!(last.next, None);

        // provider over-reported its total
        let empty = Page::from_offset(items(0), 500, 1200);
        assert_eq!(empty.next, None);
    }

    #[test]
    fn test_image_source_resolve() {
        let source = ImageSource {
            base_url: "http://plex.local:32400/".to_string(),
            headers: HeaderMap::new(),
        };
        assert_eq!(
            source.resolve("/library/metadata/1/thumb/123"),
            "http://plex.local:32400/library/metadata/1/thumb/123"
        );
        assert_eq!(
            source.resolve("https://image.tmdb.org/t/p/w500/x.jpg"),
            "https://image.tmdb.org/t/p/w500/x.jpg"
        );
    }

    #[test]
    fn test_page_total_without_reported_count() {
        assert_eq!(page_total(Some(1200), 0, 500), 1200);
        assert_eq!(page_total(None, 500, PAGE_SIZE as usize), 1001);
        assert_eq!(page_total(None, 500, 12), 512);

        // the extra item only keeps pagination going until an empty page
        let items = vec![RawItem::Jellyfin(JellyfinItem::default()); PAGE_SIZE as usize];
        let page = Page::from_offset(items, 0, page_total(None, 0, PAGE_SIZE as usize));
        assert_eq!(page.next, Some(PageToken::at(PAGE_SIZE)));
    }

    #[test]
    fn test_headers_only_for_server_origin() {
        let mut headers = HeaderMap::new();
        headers.insert("x-plex-token", "secret".parse().unwrap());
        let source = ImageSource {
            base_url: "http://plex.local:32400/".to_string(),
            headers,
        };

        let own = source.resolve("/library/metadata/1/thumb/123");
        assert!(source.headers_for(&own).is_some());

        for foreign in [
            "https://image.tmdb.org/t/p/w500/x.jpg",
            "http://plex.local:8080/thumb",
            "https://plex.local:32400/thumb",
            "not a url",
        ] {
            assert!(source.headers_for(foreign).is_none(), "{}", foreign);
        }
    }

    #[test]
    fn test_factory_matches_provider_types() {
        let factory = HttpProviderFactory::new(Client::new());

        let plex = factory.strategy_for(&integration("plex")).unwrap().unwrap();
        assert_eq!(plex.kind(), ProviderKind::Plex);
        let emby = factory.strategy_for(&integration("Emby")).unwrap().unwrap();
        assert_eq!(emby.kind(), ProviderKind::Emby);
        assert!(factory.strategy_for(&integration("kodi")).unwrap().is_none());
    }

    #[test]
    fn test_section_is_syncable() {
        let section = |kind| Section {
            key: "1".to_string(),
            title: "Library".to_string(),
            kind,
        };
        assert!(section(SectionKind::Movie).is_syncable());
        assert!(section(SectionKind::Show).is_syncable());
        assert!(!section(SectionKind::Other).is_syncable());
    }
}
