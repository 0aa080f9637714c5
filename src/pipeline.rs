//! The invoice send pipeline: render → compress → dispatch → record.
//!
//! Each send runs sequentially on its own task. Sends for different invoices
//! are independent; a second send for an invoice that is already in flight
//! is rejected rather than queued, so two requests can never both mark the
//! same `EmailStatus`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::InvoiceStore;
use crate::email::{DispatchRequest, Dispatcher, EmailProvider, PdfAttachment};
use crate::error::{AppError, DispatchError, PdfError};
use crate::models::{Client, EmailStatus, EmailTrigger, Invoice, ResendInvoiceRequest, SendOutcome};
use crate::pdf::compress::{compress_pdf, CompressionResult};
use crate::pdf::render::{render_ticket_async, RasterOptions};
use crate::templates::{compose_email, ClientOverrides};

// ============================================================================
// Shared state
// ============================================================================

/// Everything a request handler needs, injected through an axum `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn InvoiceStore>,
    pub dispatcher: Dispatcher,
    pub overrides: Arc<ClientOverrides>,
    in_flight: Arc<InFlight>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn InvoiceStore>,
        provider: Arc<dyn EmailProvider>,
        overrides: ClientOverrides,
    ) -> Self {
        let dispatcher = Dispatcher::new(provider, config.limits);
        Self {
            config: Arc::new(config),
            store,
            dispatcher,
            overrides: Arc::new(overrides),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Claim `invoice_id` for one send; `None` if a send is already running.
    pub fn try_begin_send(&self, invoice_id: &str) -> Option<InFlightGuard> {
        InFlight::try_acquire(&self.in_flight, invoice_id)
    }
}

/// Invoice ids with a send currently in progress.
#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn try_acquire(this: &Arc<Self>, id: &str) -> Option<InFlightGuard> {
        let mut ids = this.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            owner: Arc::clone(this),
            id: id.to_string(),
        })
    }
}

/// Releases the invoice id when dropped, including on error paths.
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.owner.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.id);
    }
}

// ============================================================================
// Send
// ============================================================================

/// Result of one invoice send, returned to the caller and logged.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    pub success: bool,
    pub invoice_id: String,
    pub trigger: EmailTrigger,
    pub recipients: Vec<String>,
    pub compression: Option<CompressionResult>,
    pub attachment_omitted: bool,
    pub attempts: u32,
    pub omitted_assets: Vec<String>,
    pub error: Option<String>,
    pub details: Option<String>,
}

/// Recipients for an invoice send: explicit ones win over the client record.
pub fn resolve_recipients(client: &Client, request: &ResendInvoiceRequest) -> (Vec<String>, Vec<String>) {
    let to = match &request.to {
        Some(to) => to.clone().into_list(),
        None => client.email.iter().map(|e| e.trim().to_string()).filter(|e| !e.is_empty()).collect(),
    };
    let cc = match &request.cc {
        Some(cc) => cc.clone().into_list(),
        None => client.cc_emails.clone(),
    };
    (to, cc)
}

fn attachment_filename(invoice: &Invoice) -> String {
    format!("delivery-ticket-{}.pdf", invoice.display_number())
}

/// Render, compress and email the delivery ticket for `invoice_id`, then
/// write the outcome onto the invoice's `EmailStatus`.
///
/// Provider failures come back as `Ok` with `success == false` once the
/// status is recorded; input, lookup and concurrency problems are `Err`.
pub async fn send_invoice_email(
    state: &AppState,
    invoice_id: &str,
    request: ResendInvoiceRequest,
) -> Result<SendReport, AppError> {
    let _guard = state.try_begin_send(invoice_id).ok_or_else(|| {
        AppError::Conflict(format!("A send for invoice '{}' is already in progress", invoice_id))
    })?;
    let request_id = Uuid::new_v4();
    let trigger = request.trigger.unwrap_or(EmailTrigger::Manual);
    info!(%request_id, invoice_id, ?trigger, "Starting invoice send");

    let invoice = state.store.get_invoice(invoice_id).await?;
    let client = state.store.get_client(&invoice.client_id).await?;

    let (to, cc) = resolve_recipients(&client, &request);
    if to.is_empty() {
        return Err(AppError::BadRequest(format!(
            "No recipient: client '{}' has no email address and none was given",
            client.name
        )));
    }

    let mut report = SendReport {
        success: false,
        invoice_id: invoice.id.clone(),
        trigger,
        recipients: to.iter().chain(cc.iter()).cloned().collect(),
        compression: None,
        attachment_omitted: false,
        attempts: 0,
        omitted_assets: Vec::new(),
        error: None,
        details: None,
    };

    let config = state.overrides.effective_config(&client);
    let rendered = match render_ticket_async(
        invoice.clone(),
        client.clone(),
        config,
        RasterOptions::default(),
        state.config.render_timeout,
    )
    .await
    {
        Ok(rendered) => rendered,
        Err(e) => {
            error!(%request_id, "Rendering failed: {}", e);
            record(state, &invoice, trigger, &report, Some(e.to_string())).await;
            return Err(e.into());
        }
    };
    report.omitted_assets = rendered.omitted_assets.clone();
    info!(
        %request_id,
        "Rendered {} page(s), {} bytes",
        rendered.page_count,
        rendered.byte_len
    );

    let compression = compress_ticket(state, &invoice, trigger, &report, request_id, rendered.base64).await?;

    let (subject, text) = compose_email(&invoice, &client);
    let dispatch = DispatchRequest {
        to,
        cc,
        subject,
        text,
        attachment: Some(PdfAttachment {
            filename: attachment_filename(&invoice),
            pdf_base64: compression.pdf_base64.clone(),
            level: compression.compression_level_used,
        }),
    };
    report.compression = Some(compression);

    let (dispatched, result) = state.dispatcher.dispatch_with_report(dispatch).await;
    report.attempts = dispatched.attempts;
    report.attachment_omitted = dispatched.attachment_omitted;
    if let (Some(level), Some(compression)) = (dispatched.compression_level, report.compression.as_mut()) {
        compression.compression_level_used = level;
        if let Some(size) = dispatched.attachment_size_bytes {
            compression.compressed_size_bytes = size;
        }
    }

    match result {
        Ok(()) => {
            report.success = true;
            record(state, &invoice, trigger, &report, None).await;
            info!(%request_id, attempts = report.attempts, "Invoice email sent");
        }
        Err(DispatchError::InvalidRequest(msg)) => {
            return Err(AppError::BadRequest(msg));
        }
        Err(e) => {
            report.details = e.details();
            report.error = Some(e.to_string());
            record(state, &invoice, trigger, &report, Some(e.to_string())).await;
            error!(%request_id, "Invoice email failed: {}", e);
        }
    }
    Ok(report)
}

/// Bring the rendered ticket under the attachment ceiling. A failure here is
/// recorded on the invoice just like a render failure.
async fn compress_ticket(
    state: &AppState,
    invoice: &Invoice,
    trigger: EmailTrigger,
    report: &SendReport,
    request_id: Uuid,
    pdf_base64: String,
) -> Result<CompressionResult, AppError> {
    let ceiling = state.config.limits.attachment_ceiling;
    let result = tokio::task::spawn_blocking(move || compress_pdf(&pdf_base64, ceiling))
        .await
        .unwrap_or_else(|e| Err(PdfError::Internal(e.to_string())));

    match result {
        Ok(compression) => Ok(compression),
        Err(e) => {
            error!(%request_id, "Compression failed: {}", e);
            record(state, invoice, trigger, report, Some(e.to_string())).await;
            Err(e.into())
        }
    }
}

/// Apply the send result to the invoice's stored `EmailStatus`.
///
/// A failed write is logged, never surfaced: the email outcome is already
/// final by the time this runs.
async fn record(state: &AppState, invoice: &Invoice, trigger: EmailTrigger, report: &SendReport, error: Option<String>) {
    let outcome = SendOutcome {
        recipients: report.recipients.clone(),
        compression_level: report
            .compression
            .as_ref()
            .map(|c| c.compression_level_used.as_str().to_string()),
        error,
    };
    let mut status: EmailStatus = invoice.email_status.clone();
    status.record(trigger, &outcome, Utc::now());
    if let Err(e) = state.store.update_email_status(&invoice.id, &status).await {
        warn!("Could not record email status for invoice {}: {}", invoice.id, e);
    }
}
