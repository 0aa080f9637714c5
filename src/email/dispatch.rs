//! Size-aware delivery on top of an [`EmailProvider`].
//!
//! Policy, at most [`MAX_RETRIES`] retries after the first attempt:
//! - size rejection (413 or a provider size message): recompress the PDF
//!   starting at the next ladder level and retry once; if it is rejected
//!   again, or recompression cannot get under the provider hard limit, send
//!   without the attachment and say so in the body
//! - transient failure (timeout, network, 429/5xx): retry unchanged
//! - anything else: terminal
//!
//! The dispatcher never persists anything; callers record the outcome.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::SizeLimits;
use crate::email::provider::{Attachment, EmailMessage, EmailProvider};
use crate::error::DispatchError;
use crate::pdf::compress::{compress_pdf_from, CompressionLevel};
use crate::templates::ATTACHMENT_OMITTED_NOTE;

pub const MAX_RETRIES: u32 = 2;

/// A PDF to attach, with the compression level already applied to it.
#[derive(Debug, Clone)]
pub struct PdfAttachment {
    pub filename: String,
    pub pdf_base64: String,
    pub level: CompressionLevel,
}

impl PdfAttachment {
    pub fn encoded_size(&self) -> usize {
        self.pdf_base64.len()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub attachment: Option<PdfAttachment>,
}

/// What happened on the way to the provider, successful or not.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub attempts: u32,
    pub attachment_omitted: bool,
    pub compression_level: Option<CompressionLevel>,
    pub attachment_size_bytes: Option<usize>,
}

#[derive(Clone)]
pub struct Dispatcher {
    provider: Arc<dyn EmailProvider>,
    limits: SizeLimits,
}

fn validate(request: &DispatchRequest) -> Result<(), DispatchError> {
    if request.to.is_empty() {
        return Err(DispatchError::InvalidRequest(
            "At least one recipient is required".to_string(),
        ));
    }
    if let Some(bad) = request
        .to
        .iter()
        .chain(request.cc.iter())
        .find(|addr| !addr.contains('@'))
    {
        return Err(DispatchError::InvalidRequest(format!(
            "Invalid email address: {}",
            bad
        )));
    }
    if request.subject.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("Subject is required".to_string()));
    }
    Ok(())
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn EmailProvider>, limits: SizeLimits) -> Self {
        Self { provider, limits }
    }

    /// Deliver `request`, returning the report only on success.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReport, DispatchError> {
        let (report, result) = self.dispatch_with_report(request).await;
        result.map(|()| report)
    }

    /// Deliver `request`; the report is filled in even when delivery fails.
    pub async fn dispatch_with_report(
        &self,
        request: DispatchRequest,
    ) -> (DispatchReport, Result<(), DispatchError>) {
        let mut report = DispatchReport::default();
        let result = self.run(request, &mut report).await;
        match &result {
            Ok(()) => info!(
                "Email delivered via {} after {} attempt(s) (attachment_omitted={})",
                self.provider.name(),
                report.attempts,
                report.attachment_omitted
            ),
            Err(e) => warn!(
                "Email delivery via {} failed after {} attempt(s): {}",
                self.provider.name(),
                report.attempts,
                e
            ),
        }
        (report, result)
    }

    async fn run(&self, request: DispatchRequest, report: &mut DispatchReport) -> Result<(), DispatchError> {
        validate(&request)?;

        let mut attachment = request.attachment.clone();
        let mut escalated = false;
        report.compression_level = attachment.as_ref().map(|a| a.level);

        if let Some(current) = attachment.take() {
            if current.encoded_size() > self.limits.provider_hard_limit {
                warn!(
                    "Attachment {} bytes exceeds provider hard limit {}, recompressing",
                    current.encoded_size(),
                    self.limits.provider_hard_limit
                );
                escalated = true;
                attachment = self.escalate(&current, report).await;
                if attachment.is_none() {
                    report.attachment_omitted = true;
                }
            } else {
                attachment = Some(current);
            }
        }

        loop {
            report.attempts += 1;
            report.attachment_size_bytes = attachment.as_ref().map(PdfAttachment::encoded_size);
            let message = self.message(&request, attachment.as_ref(), report.attachment_omitted);

            let err = match self.provider.send(&message).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if report.attempts > MAX_RETRIES {
                return Err(err);
            }

            if err.is_size_rejection() {
                let Some(current) = attachment.take() else {
                    return Err(err);
                };
                warn!(
                    "Attempt {}: provider rejected {} byte attachment: {}",
                    report.attempts,
                    current.encoded_size(),
                    err
                );
                if !escalated {
                    escalated = true;
                    attachment = self.escalate(&current, report).await;
                }
                if attachment.is_none() {
                    warn!("Sending without attachment");
                    report.attachment_omitted = true;
                }
            } else if err.is_retryable() {
                warn!("Attempt {} failed, retrying: {}", report.attempts, err);
            } else {
                return Err(err);
            }
        }
    }

    /// Recompress from the next ladder level; `None` when that cannot
    /// produce something smaller that fits the provider hard limit.
    async fn escalate(&self, current: &PdfAttachment, report: &mut DispatchReport) -> Option<PdfAttachment> {
        let Some(start) = current.level.next() else {
            warn!("Attachment already at the most aggressive compression level");
            return None;
        };
        let input = current.pdf_base64.clone();
        let ceiling = self.limits.attachment_ceiling;
        let result = tokio::task::spawn_blocking(move || compress_pdf_from(&input, ceiling, start)).await;

        let compressed = match result {
            Ok(Ok(compressed)) => compressed,
            Ok(Err(e)) => {
                warn!("Recompression failed: {}", e);
                return None;
            }
            Err(e) => {
                warn!("Recompression task failed: {}", e);
                return None;
            }
        };

        report.compression_level = Some(compressed.compression_level_used);
        if compressed.compressed_size_bytes >= current.encoded_size() {
            warn!("Recompression did not reduce the attachment");
            return None;
        }
        if compressed.compressed_size_bytes > self.limits.provider_hard_limit {
            warn!(
                "Recompressed attachment {} bytes still exceeds provider hard limit {}",
                compressed.compressed_size_bytes, self.limits.provider_hard_limit
            );
            return None;
        }
        info!(
            "Recompressed attachment {} -> {} bytes at level {}",
            current.encoded_size(),
            compressed.compressed_size_bytes,
            compressed.compression_level_used.as_str()
        );
        Some(PdfAttachment {
            filename: current.filename.clone(),
            pdf_base64: compressed.pdf_base64,
            level: compressed.compression_level_used,
        })
    }

    fn message(&self, request: &DispatchRequest, attachment: Option<&PdfAttachment>, omitted: bool) -> EmailMessage {
        let mut text = request.text.clone();
        if omitted {
            text.push_str(ATTACHMENT_OMITTED_NOTE);
        }
        EmailMessage {
            to: request.to.clone(),
            cc: request.cc.clone(),
            subject: request.subject.clone(),
            text,
            attachment: attachment.map(|a| Attachment::pdf(a.filename.clone(), a.pdf_base64.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::compress::tests::raw_image_pdf;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(usize, &EmailMessage) -> Result<(), DispatchError> + Send + Sync>;

    /// Records every message and answers with `respond(call_index, message)`.
    struct ScriptedProvider {
        sent: Mutex<Vec<EmailMessage>>,
        respond: Responder,
    }

    impl ScriptedProvider {
        fn new(respond: impl Fn(usize, &EmailMessage) -> Result<(), DispatchError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmailProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, message: &EmailMessage) -> Result<(), DispatchError> {
            let index = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(message.clone());
                sent.len() - 1
            };
            (self.respond)(index, message)
        }
    }

    fn too_large() -> DispatchError {
        DispatchError::PayloadTooLarge {
            status: 413,
            detail: "Payload Too Large".into(),
        }
    }

    fn request(pdf_base64: Option<String>) -> DispatchRequest {
        DispatchRequest {
            to: vec!["frontdesk@hotel.com".into()],
            cc: vec![],
            subject: "Delivery Ticket #7".into(),
            text: "Your ticket is attached.".into(),
            attachment: pdf_base64.map(|pdf_base64| PdfAttachment {
                filename: "ticket-7.pdf".into(),
                pdf_base64,
                level: CompressionLevel::None,
            }),
        }
    }

    #[tokio::test]
    async fn plain_success_is_one_attempt() {
        let provider = ScriptedProvider::new(|_, _| Ok(()));
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());
        let report = dispatcher.dispatch(request(Some(raw_image_pdf(32)))).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert!(!report.attachment_omitted);
        assert!(provider.sent()[0].attachment.is_some());
    }

    #[tokio::test]
    async fn size_rejection_recompresses_and_retries() {
        let pdf = raw_image_pdf(1420);
        assert!(pdf.len() > 8_000_000, "got {}", pdf.len());
        let provider = ScriptedProvider::new(|_, m| match &m.attachment {
            Some(a) if a.encoded_size() > 5_000_000 => Err(too_large()),
            _ => Ok(()),
        });
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());

        let report = dispatcher.dispatch(request(Some(pdf))).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert!(!report.attachment_omitted);
        assert!(report.compression_level.unwrap() >= CompressionLevel::High);
        let sent = provider.sent();
        let retried = sent[1].attachment.as_ref().unwrap();
        assert!(retried.encoded_size() <= 5_000_000);
        assert!(!sent[1].text.contains(ATTACHMENT_OMITTED_NOTE));
    }

    #[tokio::test]
    async fn repeated_size_rejection_falls_back_to_no_attachment() {
        let provider = ScriptedProvider::new(|_, m| match m.attachment {
            Some(_) => Err(too_large()),
            None => Ok(()),
        });
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());

        let report = dispatcher.dispatch(request(Some(raw_image_pdf(120)))).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert!(report.attachment_omitted);
        let sent = provider.sent();
        assert!(sent[1].attachment.is_some(), "second attempt carries the recompressed PDF");
        assert!(sent[2].attachment.is_none());
        assert!(sent[2].text.starts_with("Your ticket is attached."));
        assert!(sent[2].text.contains(ATTACHMENT_OMITTED_NOTE));
    }

    #[tokio::test]
    async fn attachment_over_hard_limit_is_never_sent() {
        let provider = ScriptedProvider::new(|_, _| Ok(()));
        let limits = SizeLimits {
            attachment_ceiling: 500,
            provider_hard_limit: 1_000,
        };
        let dispatcher = Dispatcher::new(provider.clone(), limits);

        let report = dispatcher.dispatch(request(Some(raw_image_pdf(100)))).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert!(report.attachment_omitted);
        assert!(provider.sent()[0].attachment.is_none());
    }

    #[tokio::test]
    async fn ultra_attachment_rejected_goes_straight_to_fallback() {
        let provider = ScriptedProvider::new(|_, m| match m.attachment {
            Some(_) => Err(too_large()),
            None => Ok(()),
        });
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());
        let mut req = request(Some(raw_image_pdf(16)));
        req.attachment.as_mut().unwrap().level = CompressionLevel::Ultra;

        let report = dispatcher.dispatch(req).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert!(report.attachment_omitted);
    }

    #[tokio::test]
    async fn transient_errors_share_the_retry_budget() {
        let provider = ScriptedProvider::new(|i, _| {
            if i < 2 {
                Err(DispatchError::Provider { status: 503, detail: "unavailable".into() })
            } else {
                Ok(())
            }
        });
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());
        let report = dispatcher.dispatch(request(None)).await.unwrap();
        assert_eq!(report.attempts, 3);

        let always_down = ScriptedProvider::new(|_, _| Err(DispatchError::Timeout { secs: 30 }));
        let dispatcher = Dispatcher::new(always_down.clone(), SizeLimits::default());
        let (report, result) = dispatcher.dispatch_with_report(request(None)).await;
        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
        assert_eq!(report.attempts, 1 + MAX_RETRIES);
        assert_eq!(always_down.sent().len(), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let provider = ScriptedProvider::new(|_, _| {
            Err(DispatchError::Auth { status: 401, detail: "The provided authorization grant is invalid".into() })
        });
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());
        let (report, result) = dispatcher.dispatch_with_report(request(None)).await;
        assert!(matches!(result, Err(DispatchError::Auth { .. })));
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn input_errors_never_reach_the_provider() {
        let provider = ScriptedProvider::new(|_, _| Ok(()));
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());

        let mut no_recipient = request(None);
        no_recipient.to.clear();
        assert!(matches!(
            dispatcher.dispatch(no_recipient).await,
            Err(DispatchError::InvalidRequest(_))
        ));

        let mut bad_cc = request(None);
        bad_cc.cc.push("not-an-address".into());
        assert!(matches!(
            dispatcher.dispatch(bad_cc).await,
            Err(DispatchError::InvalidRequest(_))
        ));
        assert!(provider.sent().is_empty());
    }

    #[tokio::test]
    async fn size_rejection_without_attachment_is_terminal() {
        let provider = ScriptedProvider::new(|_, _| Err(too_large()));
        let dispatcher = Dispatcher::new(provider.clone(), SizeLimits::default());
        let (report, result) = dispatcher.dispatch_with_report(request(None)).await;
        assert!(result.unwrap_err().is_size_rejection());
        assert_eq!(report.attempts, 1);
    }
}
