//! # Invoice Mailer
//!
//! Renders King Uniforms delivery tickets to PDF, compresses them to fit
//! email provider limits and delivers them through SendGrid.
//!
//! Exposes the Axum router and modules so integration tests can drive the
//! service in-process.

pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod models;
pub mod pdf;
pub mod pipeline;
pub mod routes;
pub mod templates;

use axum::extract::DefaultBodyLimit;
use axum::{Extension, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use pipeline::AppState;

/// Largest accepted request body; payloads carry base64 PDFs.
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Build the Axum router with all route modules and middleware.
///
/// The caller provides fully wired state (store, provider, config).
/// This function does NOT bind a listener.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::email::router())
        .merge(routes::invoices::router())
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
