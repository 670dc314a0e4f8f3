//! Canonical media item model
//!
//! Every provider-specific item is normalized into a [CanonicalMediaItem] before it
//! reaches the store. Identity is `(integration_id, external_key)`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum number of actors kept per item
pub const MAX_ACTORS: usize = 10;

/// Kind of media entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Show,
    Season,
    Episode,
    Music,
    Photo,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Show => "show",
            MediaType::Season => "season",
            MediaType::Episode => "episode",
            MediaType::Music => "music",
            MediaType::Photo => "photo",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaType::Movie),
            "show" => Ok(MediaType::Show),
            "season" => Ok(MediaType::Season),
            "episode" => Ok(MediaType::Episode),
            "music" => Ok(MediaType::Music),
            "photo" => Ok(MediaType::Photo),
            other => Err(format!("unknown media type '{}'", other)),
        }
    }
}

/// A single external identifier, used to match items across systems
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", content = "id", rename_all = "lowercase")]
pub enum ExternalId {
    Tmdb(i64),
    Imdb(String),
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::Tmdb(id) => write!(f, "tmdb://{}", id),
            ExternalId::Imdb(id) => write!(f, "imdb://{}", id),
        }
    }
}

/// External identifiers attached to an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
}

impl ExternalIds {
    /// Extract ids from tagged-URI guids such as `tmdb://603` or `imdb://tt0133093`.
    ///
    /// The first well-formed value for each prefix wins; unknown prefixes are ignored.
    pub fn from_guids<'a, I>(guids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ids = ExternalIds::default();
        for guid in guids {
            if let Some(value) = guid.strip_prefix("tmdb://") {
                if ids.tmdb_id.is_none() {
                    ids.tmdb_id = value.trim().parse().ok();
                }
            } else if let Some(value) = guid.strip_prefix("imdb://") {
                let value = value.trim();
                if ids.imdb_id.is_none() && !value.is_empty() {
                    ids.imdb_id = Some(value.to_string());
                }
            }
        }
        ids
    }

    /// All ids present, as individually matchable values
    pub fn ids(&self) -> Vec<ExternalId> {
        let mut ids = Vec::with_capacity(2);
        if let Some(tmdb) = self.tmdb_id {
            ids.push(ExternalId::Tmdb(tmdb));
        }
        if let Some(imdb) = &self.imdb_id {
            ids.push(ExternalId::Imdb(imdb.clone()));
        }
        ids
    }

    pub fn matches(&self, id: &ExternalId) -> bool {
        match id {
            ExternalId::Tmdb(tmdb) => self.tmdb_id == Some(*tmdb),
            ExternalId::Imdb(imdb) => self.imdb_id.as_deref() == Some(imdb.as_str()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tmdb_id.is_none() && self.imdb_id.is_none()
    }
}

/// Normalized, provider-agnostic media record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMediaItem {
    pub integration_id: String,
    pub external_key: String,
    pub section_key: String,
    pub media_type: MediaType,
    pub title: String,
    pub original_title: Option<String>,
    pub sort_title: Option<String>,
    pub year: Option<i32>,
    pub thumb_path: Option<String>,
    pub art_path: Option<String>,
    pub summary: Option<String>,
    pub genres: Vec<String>,
    pub studio: Option<String>,
    pub director: Option<String>,
    pub actors: Vec<String>,
    pub rating: Option<f64>,
    pub content_rating: Option<String>,
    pub duration_ms: Option<i64>,
    pub added_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub external_ids: ExternalIds,
}

/// Keep the first occurrence of each genre, preserving provider order.
pub fn dedupe_genres<I>(genres: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for genre in genres {
        let genre = genre.trim().to_string();
        if !genre.is_empty() && !out.iter().any(|g| g.eq_ignore_ascii_case(&genre)) {
            out.push(genre);
        }
    }
    out
}

/// Join director names with `, `; `None` when there are no directors.
pub fn join_directors<I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let names: Vec<String> = names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// First [MAX_ACTORS] non-empty actor names, in billing order.
pub fn truncate_actors<I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .take(MAX_ACTORS)
        .collect()
}

/// Treat blank provider strings as missing.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_ids_from_guids() {
        let ids = ExternalIds::from_guids(["plex://movie/5d776", "imdb://tt0133093", "tmdb://603"]);
        assert_eq!(ids.tmdb_id, Some(603));
        assert_eq!(ids.imdb_id.as_deref(), Some("tt0133093"));
        assert_eq!(
            ids.ids(),
            vec![ExternalId::Tmdb(603), ExternalId::Imdb("tt0133093".to_string())]
        );
    }

    #[test]
    fn test_external_ids_ignore_malformed() {
        let ids = ExternalIds::from_guids(["tmdb://abc", "tmdb://42", "imdb://"]);
        // malformed tmdb value does not block a later valid one
        assert_eq!(ids.tmdb_id, Some(42));
        assert_eq!(ids.imdb_id, None);
        assert!(!ids.is_empty());
        assert!(ExternalIds::from_guids(["tvdb://1"]).is_empty());
    }

    #[test]
    fn test_external_ids_matches() {
        let ids = ExternalIds {
            tmdb_id: Some(10),
            imdb_id: Some("tt1".to_string()),
        };
        assert!(ids.matches(&ExternalId::Tmdb(10)));
        assert!(ids.matches(&ExternalId::Imdb("tt1".to_string())));
        assert!(!ids.matches(&ExternalId::Tmdb(11)));
    }

    #[test]
    fn test_truncate_actors() {
        let actors: Vec<String> = (1..=14).map(|i| format!("Actor {}", i)).collect();
        let kept = truncate_actors(actors);
        assert_eq!(kept.len(), MAX_ACTORS);
        assert_eq!(kept[0], "Actor 1");
        assert_eq!(kept[9], "Actor 10");
    }

    #[test]
    fn test_join_directors() {
        assert_eq!(
            join_directors(vec!["Lana Wachowski".to_string(), "Lilly Wachowski".to_string()]),
            Some("Lana Wachowski, Lilly Wachowski".to_string())
        );
        assert_eq!(join_directors(Vec::<String>::new()), None);
    }

    #[test]
    fn test_dedupe_genres_preserves_order() {
        let genres = dedupe_genres(vec![
            "Action".to_string(),
            "Sci-Fi".to_string(),
            "action".to_string(),
            " ".to_string(),
        ]);
        assert_eq!(genres, vec!["Action", "Sci-Fi"]);
    }

    #[test]
    fn test_media_type_round_trip() {
        for ty in [MediaType::Movie, MediaType::Show, MediaType::Photo] {
            assert_eq!(ty.as_str().parse::<MediaType>().unwrap(), ty);
        }
        assert!("album".parse::<MediaType>().is_err());
    }
}
