//! Local library queries, detail artwork and targeted refresh

use std::collections::HashSet;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::api::internal_error;
use crate::db::MediaItemRecord;
use crate::media::ExternalId;

const DEFAULT_SEARCH_LIMIT: i64 = 50;
const MAX_SEARCH_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub integration: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub integration_id: String,
    pub external_key: String,
    pub media_type: String,
    pub title: String,
    pub year: Option<i32>,
    pub thumb_path: Option<String>,
    pub genres: Vec<String>,
    pub actors: Vec<String>,
    pub director: Option<String>,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
}

impl From<MediaItemRecord> for SearchResult {
    fn from(record: MediaItemRecord) -> Self {
        Self {
            genres: record.genres(),
            actors: record.actors(),
            integration_id: record.integration_instance_id,
            external_key: record.external_key,
            media_type: record.media_type,
            title: record.title,
            year: record.year,
            thumb_path: record.thumb_path,
            director: record.director,
            tmdb_id: record.tmdb_id,
            imdb_id: record.imdb_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRecentRequest {
    #[serde(default)]
    pub tmdb_ids: Vec<i64>,
    #[serde(default)]
    pub imdb_ids: Vec<String>,
}

impl RefreshRecentRequest {
    fn targets(&self) -> HashSet<ExternalId> {
        self.tmdb_ids
            .iter()
            .map(|id| ExternalId::Tmdb(*id))
            .chain(self.imdb_ids.iter().map(|id| ExternalId::Imdb(id.clone())))
            .collect()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RefreshRecentResponse {
    pub tmdb_ids: Vec<i64>,
    pub imdb_ids: Vec<String>,
}

impl RefreshRecentResponse {
    fn from_found(found: HashSet<ExternalId>) -> Self {
        let mut response = Self::default();
        for id in found {
            match id {
                ExternalId::Tmdb(tmdb) => response.tmdb_ids.push(tmdb),
                ExternalId::Imdb(imdb) => response.imdb_ids.push(imdb),
            }
        }
        response.tmdb_ids.sort_unstable();
        response.imdb_ids.sort();
        response
    }
}

/// Full-text search over the local index
async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchResult>>, (StatusCode, String)> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let records = state
        .db
        .media_items()
        .search(&query.q, query.integration.as_deref(), limit)
        .await
        .map_err(internal_error)?;

    Ok(Json(records.into_iter().map(SearchResult::from).collect()))
}

/// Large artwork for an indexed item, cached on first request
async fn detail_image(
    State(state): State<AppState>,
    Path((integration_id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let path = state
        .sync
        .detail_image(&integration_id, &key)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Image not available".to_string()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| internal_error(e.into()))?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes))
}

/// Index recently added items carrying any of the given ids, across all sync-enabled
/// integrations
async fn refresh_recent(
    State(state): State<AppState>,
    Json(body): Json<RefreshRecentRequest>,
) -> Result<Json<RefreshRecentResponse>, (StatusCode, String)> {
    let targets = body.targets();
    if targets.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "At least one of 'tmdb_ids' or 'imdb_ids' must be provided".to_string(),
        ));
    }

    let integrations = state
        .db
        .integrations()
        .list_sync_enabled()
        .await
        .map_err(internal_error)?;
    let found = state.sync.index_matching_recent(&targets, &integrations).await;

    Ok(Json(RefreshRecentResponse::from_found(found)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/library/search", get(search))
        .route("/library/items/{integration_id}/{key}/image", get(detail_image))
        .route("/library/refresh-recent", post(refresh_recent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_request_targets() {
        let request: RefreshRecentRequest =
            serde_json::from_str(r#"{"tmdb_ids": [603, 603], "imdb_ids": ["tt0133093"]}"#).unwrap();
        let targets = request.targets();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&ExternalId::Tmdb(603)));
        assert!(targets.contains(&ExternalId::Imdb("tt0133093".to_string())));

        let empty: RefreshRecentRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.targets().is_empty());
    }

    #[test]
    fn test_refresh_response_is_sorted() {
        let found: HashSet<ExternalId> = [
            ExternalId::Tmdb(9),
            ExternalId::Tmdb(3),
            ExternalId::Imdb("tt2".to_string()),
        ]
        .into_iter()
        .collect();
        let response = RefreshRecentResponse::from_found(found);
        assert_eq!(response.tmdb_ids, vec![3, 9]);
        assert_eq!(response.imdb_ids, vec!["tt2".to_string()]);
    }
}
