//! API route definitions
//!
//! REST endpoints for starting, cancelling and inspecting library syncs, purging an
//! integration's data, and querying the local index.

pub mod health;
pub mod library;
pub mod sync;

use axum::http::StatusCode;

/// Map a service error to a 500 with its message
pub(crate) fn internal_error(err: anyhow::Error) -> (StatusCode, String) {
    tracing::error!(error = %format!("{:#}", err), "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
}
