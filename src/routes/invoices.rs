//! Invoice routes.
//!
//! POST /api/invoices/{id}/send         - Render, compress and email a ticket
//! GET  /api/invoices/{id}/email-status - Email status with display trigger
//! POST /api/render-preview             - Render a ticket PDF without sending
//! GET  /health                         - Liveness

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;

use crate::error::AppError;
use crate::models::{EmailStatusResponse, RenderPreviewRequest, ResendInvoiceRequest};
use crate::pdf::encoding::decode_base64;
use crate::pdf::render::{render_ticket_async, RasterOptions};
use crate::pipeline::{send_invoice_email, AppState};

/// Build the invoice router.
pub fn router() -> Router {
    Router::new()
        .route("/api/invoices/{id}/send", post(send_invoice))
        .route("/api/invoices/{id}/email-status", get(email_status))
        .route("/api/render-preview", post(render_preview))
        .route("/health", get(health))
}

/// Send the delivery ticket for a stored invoice.
///
/// The body is optional; an empty body sends a manual email to the client's
/// own addresses.
async fn send_invoice(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: ResendInvoiceRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResendInvoiceRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))?
    };

    let report = send_invoice_email(&state, &id, request).await?;
    if report.success {
        return Ok(Json(json!({ "success": true, "report": report })).into_response());
    }

    let details = report.details.clone().or_else(|| report.error.clone());
    Ok((
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": "Failed to send email",
            "details": details,
            "report": report,
        })),
    )
        .into_response())
}

async fn email_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EmailStatusResponse>, AppError> {
    let invoice = state.store.get_invoice(&id).await?;
    Ok(Json(invoice.email_status.into()))
}

/// Render the ticket for an operator to inspect, applying client overrides.
async fn render_preview(
    Extension(state): Extension<AppState>,
    payload: Result<Json<RenderPreviewRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = payload?;
    let config = state.overrides.effective_config(&req.client);
    let rendered = render_ticket_async(
        req.invoice,
        req.client,
        config,
        RasterOptions::default(),
        state.config.render_timeout,
    )
    .await?;
    let bytes = decode_base64(&rendered.base64)?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::HeaderName::from_static("x-page-count"), rendered.page_count.to_string()),
        ],
        bytes,
    )
        .into_response())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
