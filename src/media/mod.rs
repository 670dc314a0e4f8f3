//! Media domain types

pub mod item;

pub use item::{CanonicalMediaItem, ExternalId, ExternalIds, MAX_ACTORS, MediaType};
