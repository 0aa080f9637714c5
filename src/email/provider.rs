//! Transactional email provider boundary.
//!
//! [`EmailProvider`] is the seam the dispatcher and tests plug into;
//! [`SendGridProvider`] is the production implementation over the v3 mail
//! send API.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::EmailConfig;
use crate::error::DispatchError;

/// A file attached to an outgoing message, already base64-encoded.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_base64: String,
    pub mime_type: String,
}

impl Attachment {
    pub fn pdf(filename: impl Into<String>, content_base64: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content_base64: content_base64.into(),
            mime_type: "application/pdf".to_string(),
        }
    }

    /// Size counted against provider limits.
    pub fn encoded_size(&self) -> usize {
        self.content_base64.len()
    }
}

/// One fully-resolved email, ready for a single provider call.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Short name used in logs and configuration errors.
    fn name(&self) -> &str;

    /// Submit one message. Exactly one network call per invocation.
    async fn send(&self, message: &EmailMessage) -> Result<(), DispatchError>;
}

// ============================================================================
// SendGrid
// ============================================================================

pub struct SendGridProvider {
    client: reqwest::Client,
    config: EmailConfig,
}

impl SendGridProvider {
    pub fn new(config: EmailConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Request body for the v3 `mail/send` endpoint.
    pub fn payload(&self, message: &EmailMessage) -> Value {
        let mut personalization = json!({
            "to": message.to.iter().map(|e| json!({ "email": e })).collect::<Vec<_>>(),
        });
        // SendGrid rejects a cc that repeats a `to` address.
        let cc: Vec<Value> = message
            .cc
            .iter()
            .filter(|c| !message.to.iter().any(|t| t.eq_ignore_ascii_case(c)))
            .map(|e| json!({ "email": e }))
            .collect();
        if !cc.is_empty() {
            personalization["cc"] = Value::Array(cc);
        }

        let mut body = json!({
            "personalizations": [personalization],
            "from": { "email": self.config.from_email, "name": self.config.from_name },
            "subject": message.subject,
            "content": [{ "type": "text/plain", "value": message.text }],
        });
        if let Some(att) = &message.attachment {
            body["attachments"] = json!([{
                "content": att.content_base64,
                "filename": att.filename,
                "type": att.mime_type,
                "disposition": "attachment",
            }]);
        }
        body
    }
}

/// Map a non-success response onto the dispatch error taxonomy.
pub fn classify_response(status: u16, body: &str) -> DispatchError {
    let detail = provider_detail(body);
    let lowered = detail.to_lowercase();
    let size_complaint = lowered.contains("too large")
        || lowered.contains("exceeds")
        || (lowered.contains("size") && lowered.contains("limit"));

    match status {
        413 => DispatchError::PayloadTooLarge { status, detail },
        400 if size_complaint => DispatchError::PayloadTooLarge { status, detail },
        401 | 403 => DispatchError::Auth { status, detail },
        _ => DispatchError::Provider { status, detail },
    }
}

/// Join SendGrid's `errors[].message` list, or fall back to the raw body.
fn provider_detail(body: &str) -> String {
    let messages: Option<Vec<String>> = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("errors")?.as_array().map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
    });
    match messages {
        Some(list) if !list.is_empty() => list.join("; "),
        _ => body.trim().to_string(),
    }
}

#[async_trait]
impl EmailProvider for SendGridProvider {
    fn name(&self) -> &str {
        "sendgrid"
    }

    async fn send(&self, message: &EmailMessage) -> Result<(), DispatchError> {
        let api_key = self
            .config
            .sendgrid_api_key
            .as_deref()
            .ok_or_else(|| DispatchError::NotConfigured {
                provider: self.name().to_string(),
                hint: "set SENDGRID_API_KEY".to_string(),
            })?;

        debug!(
            "POST {} to={:?} cc={:?} attachment_bytes={:?}",
            self.config.sendgrid_api_url,
            message.to,
            message.cc,
            message.attachment.as_ref().map(Attachment::encoded_size)
        );

        let response = self
            .client
            .post(&self.config.sendgrid_api_url)
            .bearer_auth(api_key)
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        secs: self.config.timeout.as_secs(),
                    }
                } else {
                    DispatchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            info!("SendGrid accepted message ({})", status);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_response(status.as_u16(), &body))
    }
}
