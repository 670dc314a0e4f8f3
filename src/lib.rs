//! Media library sync engine
//!
//! Pulls library listings from Plex, Jellyfin and Emby servers into a local SQLite index
//! with full-text search, caches artwork on disk, and serves both over a small HTTP API.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod jobs;
pub mod media;
pub mod services;

pub use app::{AppState, build_app};
