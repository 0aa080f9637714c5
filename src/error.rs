//! Error types for the invoice mailer.
//!
//! Each stage has its own error enum so callers can tell a bad request from
//! a provider outage. [`AppError`] is the HTTP-facing union and owns the
//! mapping onto status codes and `{ error, details }` bodies.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failures while decoding, rendering or recompressing a PDF.
#[derive(Debug, Error)]
pub enum PdfError {
    #[error("PDF data is empty")]
    Empty,

    #[error("PDF data is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("Decoded data is not a PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    #[error("PDF could not be parsed: {0}")]
    Parse(String),

    #[error("PDF could not be written: {0}")]
    Write(String),

    #[error("Rendering timed out after {secs}s")]
    RenderTimeout { secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures talking to the transactional email provider.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Missing recipient or other caller error; never retried.
    #[error("Invalid email request: {0}")]
    InvalidRequest(String),

    /// The provider is not set up (no API key).
    #[error("Email provider '{provider}' is not configured: {hint}")]
    NotConfigured { provider: String, hint: String },

    /// HTTP 413 or a provider-specific size complaint.
    #[error("Provider rejected the message size ({status}): {detail}")]
    PayloadTooLarge { status: u16, detail: String },

    /// Invalid key, unverified sender and similar; terminal.
    #[error("Provider authentication failed ({status}): {detail}")]
    Auth { status: u16, detail: String },

    /// Any other non-success response.
    #[error("Provider returned {status}: {detail}")]
    Provider { status: u16, detail: String },

    #[error("Provider call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Network error: {0}")]
    Network(String),
}

impl DispatchError {
    pub fn is_size_rejection(&self) -> bool {
        matches!(self, DispatchError::PayloadTooLarge { .. })
    }

    /// Transient failures worth another attempt within the retry budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Timeout { .. } | DispatchError::Network(_) => true,
            DispatchError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Raw provider message, surfaced to operators as `details`.
    pub fn details(&self) -> Option<String> {
        match self {
            DispatchError::PayloadTooLarge { detail, .. }
            | DispatchError::Auth { detail, .. }
            | DispatchError::Provider { detail, .. } => Some(detail.clone()),
            DispatchError::NotConfigured { hint, .. } => Some(hint.clone()),
            _ => None,
        }
    }
}

/// Failures reading or writing invoice/client documents.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invoice '{0}' not found")]
    InvoiceNotFound(String),

    #[error("Client '{0}' not found")]
    ClientNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// HTTP-facing error for all routes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Pdf(#[from] PdfError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvoiceNotFound(_) | StoreError::ClientNotFound(_) => {
                AppError::NotFound(e.to_string())
            }
            other => AppError::Store(other),
        }
    }
}

/// Malformed or mistyped JSON bodies answer with the usual `{ error }` shape.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Pdf(PdfError::Empty)
            | AppError::Pdf(PdfError::InvalidBase64(_))
            | AppError::Pdf(PdfError::NotAPdf { .. }) => StatusCode::BAD_REQUEST,
            AppError::Dispatch(DispatchError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            AppError::Pdf(_) | AppError::Dispatch(_) | AppError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Dispatch(e) if status.is_server_error() => json!({
                "error": "Failed to send email",
                "details": e.details().unwrap_or_else(|| e.to_string()),
            }),
            other => json!({ "error": other.to_string() }),
        };
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, self);
        }
        (status, Json(body)).into_response()
    }
}
