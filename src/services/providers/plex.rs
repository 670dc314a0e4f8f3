//! Plex Media Server strategy
//!
//! Uses the JSON flavour of the Plex API (`Accept: application/json`). Items are paged
//! with `X-Plex-Container-Start` / `X-Plex-Container-Size`, and `includeGuids=1` makes
//! Plex return the `tmdb://` / `imdb://` guid list used for external ids.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use super::{
    ImageSource, PAGE_SIZE, Page, PageToken, ProviderError, ProviderKind, ProviderSyncStrategy,
    RawItem, Section, SectionKind, page_total,
};
use crate::media::item::{dedupe_genres, join_directors, non_empty, truncate_actors};
use crate::media::{CanonicalMediaItem, ExternalIds, MediaType};
use crate::services::rate_limiter::{NO_QUERY, RateLimitedClient};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MediaContainerResponse<T> {
    #[serde(rename = "MediaContainer")]
    media_container: T,
}

#[derive(Debug, Default, Deserialize)]
struct SectionsContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<PlexDirectory>,
}

#[derive(Debug, Deserialize)]
struct PlexDirectory {
    key: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemsContainer {
    total_size: Option<u64>,
    size: Option<u64>,
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlexMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexTag {
    pub tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexGuid {
    pub id: String,
}

/// A library item as returned by `/library/sections/{key}/all`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexMetadata {
    pub rating_key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    pub original_title: Option<String>,
    pub title_sort: Option<String>,
    pub year: Option<i32>,
    pub thumb: Option<String>,
    pub art: Option<String>,
    pub summary: Option<String>,
    pub studio: Option<String>,
    pub rating: Option<f64>,
    pub audience_rating: Option<f64>,
    pub content_rating: Option<String>,
    /// Milliseconds
    pub duration: Option<i64>,
    pub added_at: Option<i64>,
    pub updated_at: Option<i64>,
    #[serde(rename = "Genre", default)]
    pub genres: Vec<PlexTag>,
    #[serde(rename = "Director", default)]
    pub directors: Vec<PlexTag>,
    #[serde(rename = "Role", default)]
    pub roles: Vec<PlexTag>,
    #[serde(rename = "Guid", default)]
    pub guids: Vec<PlexGuid>,
}

impl PlexMetadata {
    pub fn external_ids(&self) -> ExternalIds {
        ExternalIds::from_guids(self.guids.iter().map(|g| g.id.as_str()))
    }

    fn media_type(&self) -> Option<MediaType> {
        match self.kind.as_str() {
            "movie" => Some(MediaType::Movie),
            "show" => Some(MediaType::Show),
            "season" => Some(MediaType::Season),
            "episode" => Some(MediaType::Episode),
            "artist" | "album" | "track" => Some(MediaType::Music),
            "photo" => Some(MediaType::Photo),
            _ => None,
        }
    }

    pub fn into_canonical(
        self,
        integration_id: &str,
        section_key: &str,
    ) -> Option<CanonicalMediaItem> {
        let media_type = self.media_type()?;
        if self.rating_key.is_empty() {
            return None;
        }
        let external_ids = self.external_ids();

        Some(CanonicalMediaItem {
            integration_id: integration_id.to_string(),
            external_key: self.rating_key,
            section_key: section_key.to_string(),
            media_type,
            title: self.title,
            original_title: non_empty(self.original_title),
            sort_title: non_empty(self.title_sort),
            year: self.year,
            thumb_path: non_empty(self.thumb),
            art_path: non_empty(self.art),
            summary: non_empty(self.summary),
            genres: dedupe_genres(self.genres.into_iter().map(|t| t.tag)),
            studio: non_empty(self.studio),
            director: join_directors(self.directors.into_iter().map(|t| t.tag)),
            actors: truncate_actors(self.roles.into_iter().map(|t| t.tag)),
            rating: self.rating.or(self.audience_rating),
            content_rating: non_empty(self.content_rating),
            duration_ms: self.duration,
            added_at: self.added_at,
            updated_at: self.updated_at,
            external_ids,
        })
    }
}

fn section_kind(kind: &str) -> SectionKind {
    match kind {
        "movie" => SectionKind::Movie,
        "show" => SectionKind::Show,
        _ => SectionKind::Other,
    }
}

// ============================================================================
// Strategy
// ============================================================================

pub struct PlexStrategy {
    http: RateLimitedClient,
    base_url: String,
    headers: HeaderMap,
}

impl PlexStrategy {
    pub fn new(http: RateLimitedClient, base_url: &str, token: &str) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-plex-token",
            HeaderValue::from_str(token)
                .map_err(|e| ProviderError::InvalidRequest(format!("invalid Plex token: {}", e)))?,
        );

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_items(
        &self,
        section: &Section,
        start: u32,
        size: u32,
        extra: &[(&str, &str)],
    ) -> Result<ItemsContainer, ProviderError> {
        let url = self.url(&format!("/library/sections/{}/all", section.key));
        let start = start.to_string();
        let size = size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("X-Plex-Container-Start", start.as_str()),
            ("X-Plex-Container-Size", size.as_str()),
        ];
        query.extend_from_slice(extra);

        let response: MediaContainerResponse<ItemsContainer> =
            self.http.get_json(&url, &self.headers, &query).await?;
        Ok(response.media_container)
    }
}

#[async_trait]
impl ProviderSyncStrategy for PlexStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Plex
    }

    async fn list_sections(&self) -> Result<Vec<Section>, ProviderError> {
        let response: MediaContainerResponse<SectionsContainer> = self
            .http
            .get_json(&self.url("/library/sections"), &self.headers, NO_QUERY)
            .await?;

        Ok(response
            .media_container
            .directory
            .into_iter()
            .map(|d| Section {
                kind: section_kind(&d.kind),
                key: d.key,
                title: d.title,
            })
            .collect())
    }

    async fn count_items(&self, section: &Section) -> Result<u64, ProviderError> {
        let container = self.fetch_items(section, 0, 0, &[]).await?;
        Ok(container.total_size.or(container.size).unwrap_or(0))
    }

    async fn fetch_page(&self, section: &Section, token: PageToken) -> Result<Page, ProviderError> {
        let container = self
            .fetch_items(section, token.offset(), PAGE_SIZE, &[("includeGuids", "1")])
            .await?;
        let fetched = container.metadata.len();
        let total = page_total(container.total_size, token.offset(), fetched);
        debug!(section = %section.key, offset = token.offset(), fetched, total, "Fetched Plex page");

        let items = container.metadata.into_iter().map(RawItem::Plex).collect();
        Ok(Page::from_offset(items, token.offset(), total))
    }

    async fn fetch_recent(
        &self,
        section: &Section,
        limit: u32,
    ) -> Result<Vec<RawItem>, ProviderError> {
        let container = self
            .fetch_items(
                section,
                0,
                limit,
                &[("includeGuids", "1"), ("sort", "addedAt:desc")],
            )
            .await?;
        Ok(container.metadata.into_iter().map(RawItem::Plex).collect())
    }

    fn image_source(&self) -> ImageSource {
        ImageSource {
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ITEMS_JSON: &str = r#"{
        "MediaContainer": {
            "size": 2,
            "totalSize": 1200,
            "offset": 0,
            "Metadata": [
                {
                    "ratingKey": "603",
                    "type": "movie",
                    "title": "The Matrix",
                    "titleSort": "Matrix",
                    "year": 1999,
                    "thumb": "/library/metadata/603/thumb/1700000000",
                    "art": "/library/metadata/603/art/1700000000",
                    "summary": "Neo takes the red pill.",
                    "studio": "Warner Bros.",
                    "audienceRating": 8.7,
                    "contentRating": "R",
                    "duration": 8160000,
                    "addedAt": 1700000000,
                    "updatedAt": 1700000500,
                    "Genre": [{"tag": "Action"}, {"tag": "Science Fiction"}],
                    "Director": [{"tag": "Lana Wachowski"}, {"tag": "Lilly Wachowski"}],
                    "Role": [
                        {"tag": "Keanu Reeves"}, {"tag": "Laurence Fishburne"},
                        {"tag": "Carrie-Anne Moss"}, {"tag": "Hugo Weaving"},
                        {"tag": "Joe Pantoliano"}, {"tag": "Marcus Chong"},
                        {"tag": "Julian Arahanga"}, {"tag": "Matt Doran"},
                        {"tag": "Gloria Foster"}, {"tag": "Belinda McClory"},
                        {"tag": "Anthony Ray Parker"}
                    ],
                    "Guid": [
                        {"id": "imdb://tt0133093"},
                        {"id": "tmdb://603"},
                        {"id": "tvdb://169"}
                    ]
                },
                {
                    "ratingKey": "9001",
                    "type": "clip",
                    "title": "Trailer"
                }
            ]
        }
    }"#;

    #[test]
    fn test_maps_movie_into_canonical() {
        let response: MediaContainerResponse<ItemsContainer> =
            serde_json::from_str(ITEMS_JSON).unwrap();
        let container = response.media_container;
        assert_eq!(container.total_size, Some(1200));

        let mut items = container.metadata.into_iter();
        let movie = items.next().unwrap().into_canonical("plex-1", "1").unwrap();

        assert_eq!(movie.external_key, "603");
        assert_eq!(movie.media_type, MediaType::Movie);
        assert_eq!(movie.sort_title.as_deref(), Some("Matrix"));
        assert_eq!(movie.rating, Some(8.7));
        assert_eq!(movie.genres, vec!["Action", "Science Fiction"]);
        assert_eq!(
            movie.director.as_deref(),
            Some("Lana Wachowski, Lilly Wachowski")
        );
        assert_eq!(movie.actors.len(), 10);
        assert_eq!(movie.actors[0], "Keanu Reeves");
        assert_eq!(movie.external_ids.tmdb_id, Some(603));
        assert_eq!(movie.external_ids.imdb_id.as_deref(), Some("tt0133093"));
        assert_eq!(movie.duration_ms, Some(8_160_000));
        assert_eq!(movie.added_at, Some(1_700_000_000));

        // unsupported types are skipped
        assert!(items.next().unwrap().into_canonical("plex-1", "1").is_none());
    }

    #[test]
    fn test_parses_sections() {
        let json = r#"{"MediaContainer": {"size": 3, "Directory": [
            {"key": "1", "title": "Movies", "type": "movie"},
            {"key": "2", "title": "TV Shows", "type": "show"},
            {"key": "3", "title": "Music", "type": "artist"}
        ]}}"#;
        let response: MediaContainerResponse<SectionsContainer> =
            serde_json::from_str(json).unwrap();
        let kinds: Vec<SectionKind> = response
            .media_container
            .directory
            .iter()
            .map(|d| section_kind(&d.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![SectionKind::Movie, SectionKind::Show, SectionKind::Other]
        );
    }

    #[test]
    fn test_empty_container_defaults() {
        let response: MediaContainerResponse<ItemsContainer> =
            serde_json::from_str(r#"{"MediaContainer": {"size": 0, "totalSize": 0}}"#).unwrap();
        assert!(response.media_container.metadata.is_empty());
    }
}
