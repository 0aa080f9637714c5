//! Email relay routes.
//!
//! POST /api/send-invoice    - Send a caller-rendered ticket PDF
//! POST /api/send-test-email - Send a test message, PDF optional

use axum::extract::rejection::JsonRejection;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::email::{DispatchRequest, PdfAttachment};
use crate::error::{AppError, PdfError};
use crate::models::{Recipients, SendInvoiceRequest, SendTestEmailRequest};
use crate::pdf::compress::compress_pdf;
use crate::pdf::encoding::decode_pdf;
use crate::pipeline::AppState;

/// Build the email relay router.
pub fn router() -> Router {
    Router::new()
        .route("/api/send-invoice", post(send_invoice))
        .route("/api/send-test-email", post(send_test_email))
}

fn required<T>(value: Option<T>, missing: &mut Vec<&'static str>, field: &'static str) -> Option<T> {
    if value.is_none() {
        missing.push(field);
    }
    value
}

fn recipients(value: Option<Recipients>) -> Vec<String> {
    value.map(Recipients::into_list).unwrap_or_default()
}

fn filename_for(invoice_number: Option<&str>) -> String {
    match invoice_number.map(str::trim).filter(|n| !n.is_empty()) {
        Some(number) => format!("delivery-ticket-{}.pdf", number),
        None => "delivery-ticket.pdf".to_string(),
    }
}

/// Validate a posted PDF and bring it under the attachment ceiling.
async fn prepare_attachment(
    state: &AppState,
    pdf_base64: String,
    invoice_number: Option<&str>,
) -> Result<PdfAttachment, AppError> {
    // Reject junk with a 400 before any compression work.
    decode_pdf(&pdf_base64)?;

    let ceiling = state.config.limits.attachment_ceiling;
    let result = tokio::task::spawn_blocking(move || compress_pdf(&pdf_base64, ceiling))
        .await
        .map_err(|e| PdfError::Internal(e.to_string()))??;

    info!(
        "Attachment {} -> {} bytes (level {}, fits={})",
        result.original_size_bytes,
        result.compressed_size_bytes,
        result.compression_level_used.as_str(),
        result.success
    );
    Ok(PdfAttachment {
        filename: filename_for(invoice_number),
        pdf_base64: result.pdf_base64,
        level: result.compression_level_used,
    })
}

/// Relay a ticket PDF rendered by the caller.
async fn send_invoice(
    Extension(state): Extension<AppState>,
    payload: Result<Json<SendInvoiceRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(req) = payload?;
    let mut missing = Vec::new();
    let to = required(req.to, &mut missing, "to").map(Recipients::into_list);
    let subject = required(req.subject.filter(|s| !s.trim().is_empty()), &mut missing, "subject");
    let text = required(req.text, &mut missing, "text");
    let pdf = required(req.pdf_base64.filter(|p| !p.trim().is_empty()), &mut missing, "pdfBase64");

    let (Some(to), Some(subject), Some(text), Some(pdf)) = (to, subject, text, pdf) else {
        return Err(AppError::BadRequest(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    };

    let attachment = prepare_attachment(&state, pdf, req.invoice_number.as_deref()).await?;
    let report = state
        .dispatcher
        .dispatch(DispatchRequest {
            to,
            cc: Vec::new(),
            subject,
            text,
            attachment: Some(attachment),
        })
        .await?;

    Ok(Json(json!({ "success": true, "report": report })))
}

/// Send a test message, attaching the PDF only when one is supplied.
async fn send_test_email(
    Extension(state): Extension<AppState>,
    payload: Result<Json<SendTestEmailRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(req) = payload?;
    let mut missing = Vec::new();
    let to = required(Some(recipients(req.to)).filter(|to| !to.is_empty()), &mut missing, "to");
    let subject = required(req.subject.filter(|s| !s.trim().is_empty()), &mut missing, "subject");
    let text = required(req.body, &mut missing, "body");

    let (Some(to), Some(subject), Some(text)) = (to, subject, text) else {
        return Err(AppError::BadRequest(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    };

    let attachment = match req.pdf_base64.filter(|p| !p.trim().is_empty()) {
        Some(pdf) => Some(prepare_attachment(&state, pdf, req.invoice_number.as_deref()).await?),
        None => None,
    };

    let report = state
        .dispatcher
        .dispatch(DispatchRequest {
            to,
            cc: recipients(req.cc),
            subject,
            text,
            attachment,
        })
        .await?;

    Ok(Json(json!({ "success": true, "report": report })))
}
