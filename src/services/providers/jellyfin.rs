//! Jellyfin and Emby strategy
//!
//! Both servers expose the same item API (`/Items` with `StartIndex` / `Limit` and a
//! `TotalRecordCount`); they differ only in how the access token is sent.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use super::{
    ImageSource, PAGE_SIZE, Page, PageToken, ProviderError, ProviderKind, ProviderSyncStrategy,
    RawItem, Section, SectionKind, page_total,
};
use crate::db::sqlite_helpers::rfc3339_to_unix;
use crate::media::item::{dedupe_genres, join_directors, non_empty, truncate_actors};
use crate::media::{CanonicalMediaItem, ExternalIds, MediaType};
use crate::services::rate_limiter::{NO_QUERY, RateLimitedClient};

/// Fields requested on every item listing
const ITEM_FIELDS: &str =
    "Overview,Genres,Studios,People,ProviderIds,OriginalTitle,SortName,DateCreated,DateLastSaved";

/// Jellyfin ticks are 100ns
const TICKS_PER_MILLISECOND: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JellyfinFlavor {
    Jellyfin,
    Emby,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    total_record_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LibraryView {
    id: String,
    #[serde(default)]
    name: String,
    collection_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Person {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
}

/// A library item as returned by `/Items`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JellyfinItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    pub original_title: Option<String>,
    pub sort_name: Option<String>,
    pub production_year: Option<i32>,
    pub overview: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub studios: Vec<NameRef>,
    #[serde(default)]
    pub people: Vec<Person>,
    pub community_rating: Option<f64>,
    pub official_rating: Option<String>,
    pub run_time_ticks: Option<i64>,
    pub date_created: Option<String>,
    pub date_last_saved: Option<String>,
    #[serde(default)]
    pub provider_ids: HashMap<String, String>,
    #[serde(default)]
    pub image_tags: HashMap<String, String>,
    #[serde(default)]
    pub backdrop_image_tags: Vec<String>,
}

impl JellyfinItem {
    /// Provider ids re-expressed as `tmdb://` / `imdb://` guids
    pub fn external_ids(&self) -> ExternalIds {
        let mut ids: Vec<(&String, &String)> = self.provider_ids.iter().collect();
        // HashMap order is unstable; keep the first-wins rule deterministic
        ids.sort();
        let guids: Vec<String> = ids
            .into_iter()
            .filter_map(|(source, value)| match source.to_ascii_lowercase().as_str() {
                "tmdb" => Some(format!("tmdb://{}", value)),
                "imdb" => Some(format!("imdb://{}", value)),
                _ => None,
            })
            .collect();
        ExternalIds::from_guids(guids.iter().map(String::as_str))
    }

    fn media_type(&self) -> Option<MediaType> {
        match self.kind.as_str() {
            "Movie" => Some(MediaType::Movie),
            "Series" => Some(MediaType::Show),
            "Season" => Some(MediaType::Season),
            "Episode" => Some(MediaType::Episode),
            "MusicArtist" | "MusicAlbum" | "Audio" => Some(MediaType::Music),
            "Photo" => Some(MediaType::Photo),
            _ => None,
        }
    }

    fn people_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = String> + 'a {
        self.people
            .iter()
            .filter(move |p| p.kind == kind)
            .map(|p| p.name.clone())
    }

    pub fn into_canonical(
        self,
        integration_id: &str,
        section_key: &str,
    ) -> Option<CanonicalMediaItem> {
        let media_type = self.media_type()?;
        if self.id.is_empty() {
            return None;
        }
        let external_ids = self.external_ids();
        let director = join_directors(self.people_of("Director"));
        let actors = truncate_actors(self.people_of("Actor"));
        let thumb_path = self
            .image_tags
            .contains_key("Primary")
            .then(|| format!("/Items/{}/Images/Primary", self.id));
        let art_path = (!self.backdrop_image_tags.is_empty())
            .then(|| format!("/Items/{}/Images/Backdrop", self.id));

        Some(CanonicalMediaItem {
            integration_id: integration_id.to_string(),
            external_key: self.id,
            section_key: section_key.to_string(),
            media_type,
            title: self.name,
            original_title: non_empty(self.original_title),
            sort_title: non_empty(self.sort_name),
            year: self.production_year,
            thumb_path,
            art_path,
            summary: non_empty(self.overview),
            genres: dedupe_genres(self.genres),
            studio: self.studios.into_iter().map(|s| s.name).find(|s| !s.is_empty()),
            director,
            actors,
            rating: self.community_rating,
            content_rating: non_empty(self.official_rating),
            duration_ms: self.run_time_ticks.map(|t| t / TICKS_PER_MILLISECOND),
            added_at: self.date_created.as_deref().and_then(rfc3339_to_unix),
            updated_at: self.date_last_saved.as_deref().and_then(rfc3339_to_unix),
            external_ids,
        })
    }
}

fn section_kind(collection_type: Option<&str>) -> SectionKind {
    match collection_type {
        Some("movies") => SectionKind::Movie,
        Some("tvshows") => SectionKind::Show,
        _ => SectionKind::Other,
    }
}

// ============================================================================
// Strategy
// ============================================================================

pub struct JellyfinStrategy {
    http: RateLimitedClient,
    base_url: String,
    headers: HeaderMap,
    user_id: Option<String>,
    flavor: JellyfinFlavor,
}

impl JellyfinStrategy {
    pub fn new(
        http: RateLimitedClient,
        base_url: &str,
        token: &str,
        user_id: Option<String>,
        flavor: JellyfinFlavor,
    ) -> Result<Self, ProviderError> {
        let invalid =
            |e: reqwest::header::InvalidHeaderValue| ProviderError::InvalidRequest(format!("invalid token: {}", e));

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        match flavor {
            JellyfinFlavor::Jellyfin => {
                let value = format!("MediaBrowser Token=\"{}\"", token);
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).map_err(invalid)?);
            }
            JellyfinFlavor::Emby => {
                headers.insert("x-emby-token", HeaderValue::from_str(token).map_err(invalid)?);
            }
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            user_id: user_id.filter(|u| !u.is_empty()),
            flavor,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn items_url(&self) -> String {
        match &self.user_id {
            Some(user) => self.url(&format!("/Users/{}/Items", user)),
            None => self.url("/Items"),
        }
    }

    async fn fetch_items(
        &self,
        section: &Section,
        start: u32,
        limit: u32,
        extra: &[(&str, &str)],
    ) -> Result<ItemsResponse<JellyfinItem>, ProviderError> {
        let start = start.to_string();
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("ParentId", section.key.as_str()),
            ("Recursive", "true"),
            ("IncludeItemTypes", "Movie,Series"),
            ("StartIndex", start.as_str()),
            ("Limit", limit.as_str()),
        ];
        query.extend_from_slice(extra);

        self.http
            .get_json(&self.items_url(), &self.headers, &query)
            .await
    }
}

#[async_trait]
impl ProviderSyncStrategy for JellyfinStrategy {
    fn kind(&self) -> ProviderKind {
        match self.flavor {
            JellyfinFlavor::Jellyfin => ProviderKind::Jellyfin,
            JellyfinFlavor::Emby => ProviderKind::Emby,
        }
    }

    async fn list_sections(&self) -> Result<Vec<Section>, ProviderError> {
        let url = match &self.user_id {
            Some(user) => self.url(&format!("/Users/{}/Views", user)),
            None => self.url("/Library/MediaFolders"),
        };
        let response: ItemsResponse<LibraryView> =
            self.http.get_json(&url, &self.headers, NO_QUERY).await?;

        Ok(response
            .items
            .into_iter()
            .map(|view| Section {
                kind: section_kind(view.collection_type.as_deref()),
                key: view.id,
                title: view.name,
            })
            .collect())
    }

    async fn count_items(&self, section: &Section) -> Result<u64, ProviderError> {
        let response = self.fetch_items(section, 0, 0, &[]).await?;
        Ok(response.total_record_count.unwrap_or(0))
    }

    async fn fetch_page(&self, section: &Section, token: PageToken) -> Result<Page, ProviderError> {
        let response = self
            .fetch_items(section, token.offset(), PAGE_SIZE, &[("Fields", ITEM_FIELDS)])
            .await?;
        let fetched = response.items.len();
        let total = page_total(response.total_record_count, token.offset(), fetched);
        debug!(section = %section.key, offset = token.offset(), fetched, total, "Fetched Jellyfin page");

        let items = response.items.into_iter().map(RawItem::Jellyfin).collect();
        Ok(Page::from_offset(items, token.offset(), total))
    }

    async fn fetch_recent(
        &self,
        section: &Section,
        limit: u32,
    ) -> Result<Vec<RawItem>, ProviderError> {
        let response = self
            .fetch_items(
                section,
                0,
                limit,
                &[
                    ("Fields", ITEM_FIELDS),
                    ("SortBy", "DateCreated"),
                    ("SortOrder", "Descending"),
                ],
            )
            .await?;
        Ok(response.items.into_iter().map(RawItem::Jellyfin).collect())
    }

    fn image_source(&self) -> ImageSource {
        ImageSource {
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
        }
    }
}
