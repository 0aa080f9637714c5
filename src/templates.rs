//! Email subject/body templates and per-client print overrides.
//!
//! Templates use `{token}` placeholders filled from the invoice and client.
//! Client-specific exceptions (a larger font for one hotel, hidden quantities
//! for another) live in a data table keyed by normalised client name instead
//! of being scattered through the renderer.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::models::{Client, Invoice, PrintConfiguration};

pub const DEFAULT_SUBJECT: &str = "Delivery Ticket #{invoiceNumber} - {clientName}";

pub const DEFAULT_BODY: &str = "Dear {clientName},\n\n\
Please find attached the delivery ticket #{invoiceNumber} for your delivery on {deliveryDate}.\n\n\
Received by: {signerName} on {signatureDate} at {signatureTime}.\n\
Driver: {driverName}\n\n\
Thank you for choosing King Uniforms.";

/// Appended to the body when the PDF could not be attached.
pub const ATTACHMENT_OMITTED_NOTE: &str = "\n\nNote: the delivery ticket PDF was too large to attach to this email. \
It is available separately on request from King Uniforms.";

// ============================================================================
// Placeholders
// ============================================================================

/// Values substituted into subject and body templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateValues {
    pub client_name: String,
    pub invoice_number: String,
    pub signer_name: String,
    pub signature_date: String,
    pub signature_time: String,
    pub driver_name: String,
    pub delivery_date: String,
}

impl TemplateValues {
    pub fn from_invoice(invoice: &Invoice, client: &Client) -> Self {
        let signature = invoice.signature.as_ref();
        let signed_at = signature.and_then(|s| s.signed_at);
        let delivery = invoice
            .delivery_date
            .unwrap_or_else(|| invoice.created_at.date_naive());
        Self {
            client_name: client.name.clone(),
            invoice_number: invoice.display_number().to_string(),
            signer_name: signature.map(|s| s.display_name()).unwrap_or_default(),
            signature_date: signed_at
                .map(|t| t.format("%m/%d/%Y").to_string())
                .unwrap_or_default(),
            signature_time: signed_at
                .map(|t| t.format("%I:%M %p").to_string())
                .unwrap_or_default(),
            driver_name: invoice.driver_name.clone().unwrap_or_default(),
            delivery_date: delivery.format("%m/%d/%Y").to_string(),
        }
    }

    fn lookup(&self, token: &str) -> Option<&str> {
        let value = match token {
            "clientName" => &self.client_name,
            "invoiceNumber" => &self.invoice_number,
            "signerName" => &self.signer_name,
            "signatureDate" => &self.signature_date,
            "signatureTime" => &self.signature_time,
            "driverName" => &self.driver_name,
            "deliveryDate" => &self.delivery_date,
            _ => return None,
        };
        Some(value.as_str())
    }
}

/// Replace known `{token}`s; unknown tokens and stray braces stay verbatim.
pub fn render_template(template: &str, values: &TemplateValues) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => match values.lookup(&after[..close]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            },
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Subject and body for an invoice, using the client's templates when set.
pub fn compose_email(invoice: &Invoice, client: &Client) -> (String, String) {
    let values = TemplateValues::from_invoice(invoice, client);
    let cfg = &client.print_config;
    let subject = cfg
        .email_subject_template
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_SUBJECT);
    let body = cfg
        .email_body_template
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_BODY);
    (render_template(subject, &values), render_template(body, &values))
}

// ============================================================================
// Client overrides
// ============================================================================

/// Print settings forced for a specific client.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOverride {
    #[serde(default)]
    pub body_font_size: Option<f32>,
    #[serde(default)]
    pub header_font_size: Option<f32>,
    #[serde(default)]
    pub show_quantities: Option<bool>,
}

impl ClientOverride {
    pub fn apply(&self, config: &mut PrintConfiguration) {
        if let Some(size) = self.body_font_size {
            config.body_font_size = size;
        }
        if let Some(size) = self.header_font_size {
            config.header_font_size = size;
        }
        if let Some(show) = self.show_quantities {
            config.show_quantities = Some(show);
        }
    }
}

/// Lookup table `client name → override`, loaded once at startup.
///
/// Keys match case- and whitespace-insensitively; accents are significant.
#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    entries: HashMap<String, ClientOverride>,
}

fn client_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl ClientOverrides {
    /// Overrides shipped with the service.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert(
            "Costa Bahía",
            ClientOverride {
                body_font_size: Some(12.0),
                header_font_size: Some(18.0),
                show_quantities: None,
            },
        );
        table
    }

    pub fn insert(&mut self, client_name: &str, entry: ClientOverride) {
        self.entries.insert(client_key(client_name), entry);
    }

    pub fn get(&self, client_name: &str) -> Option<&ClientOverride> {
        self.entries.get(&client_key(client_name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a JSON object of `{ "Client Name": { ...override } }`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, ClientOverride> = serde_json::from_str(json)?;
        let mut table = Self::default();
        for (name, entry) in raw {
            table.insert(&name, entry);
        }
        Ok(table)
    }

    /// Built-in table merged with the file at `path`; file entries win.
    ///
    /// An unreadable or malformed file is logged and ignored.
    pub fn load(path: Option<&str>) -> Self {
        let mut table = Self::builtin();
        let Some(path) = path else {
            return table;
        };
        match std::fs::read_to_string(Path::new(path)) {
            Ok(json) => match Self::from_json(&json) {
                Ok(file) => {
                    info!("Loaded {} client override(s) from {}", file.len(), path);
                    table.entries.extend(file.entries);
                }
                Err(e) => warn!("Ignoring malformed client overrides in {}: {}", path, e),
            },
            Err(e) => warn!("Could not read client overrides {}: {}", path, e),
        }
        table
    }

    /// The client's print configuration with any override applied.
    pub fn effective_config(&self, client: &Client) -> PrintConfiguration {
        let mut config = client.print_config.clone();
        if let Some(entry) = self.get(&client.name) {
            entry.apply(&mut config);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Signature;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn fixtures() -> (Invoice, Client) {
        let mut invoice = Invoice::new("doc-9", "c-2", Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap());
        invoice.invoice_number = Some("5531".into());
        invoice.driver_name = Some("Luis".into());
        invoice.delivery_date = NaiveDate::from_ymd_opt(2025, 1, 16);
        invoice.signature = Some(Signature {
            signer_name: Some("Carla".into()),
            signed_at: Some(Utc.with_ymd_and_hms(2025, 1, 16, 15, 42, 0).unwrap()),
            ..Default::default()
        });
        let client = Client {
            id: "c-2".into(),
            name: "Costa Bahía".into(),
            email: None,
            cc_emails: vec![],
            address: None,
            logo_base64: None,
            print_config: PrintConfiguration::default(),
        };
        (invoice, client)
    }

    #[test]
    fn all_placeholders_are_substituted() {
        let (invoice, client) = fixtures();
        let values = TemplateValues::from_invoice(&invoice, &client);
        let out = render_template(
            "{clientName}|{invoiceNumber}|{signerName}|{signatureDate}|{signatureTime}|{driverName}|{deliveryDate}",
            &values,
        );
        assert_eq!(out, "Costa Bahía|5531|Carla|01/16/2025|03:42 PM|Luis|01/16/2025");
    }

    #[test]
    fn unknown_tokens_and_stray_braces_survive() {
        let values = TemplateValues {
            client_name: "Acme".into(),
            ..Default::default()
        };
        assert_eq!(render_template("{foo} {clientName} {", &values), "{foo} Acme {");
        assert_eq!(render_template("{{clientName}}", &values), "{Acme}");
        assert_eq!(render_template("no tokens", &values), "no tokens");
    }

    #[test]
    fn compose_uses_defaults_then_client_templates() {
        let (invoice, mut client) = fixtures();
        let (subject, body) = compose_email(&invoice, &client);
        assert_eq!(subject, "Delivery Ticket #5531 - Costa Bahía");
        assert!(body.contains("Received by: Carla"));

        client.print_config.email_subject_template = Some("Ticket {invoiceNumber}".into());
        client.print_config.email_body_template = Some("  ".into());
        let (subject, body) = compose_email(&invoice, &client);
        assert_eq!(subject, "Ticket 5531");
        assert!(body.starts_with("Dear Costa Bahía"));
    }

    #[test]
    fn no_authorized_personnel_fills_signer() {
        let (mut invoice, client) = fixtures();
        invoice.signature.as_mut().unwrap().no_authorized_personnel = true;
        let values = TemplateValues::from_invoice(&invoice, &client);
        assert_eq!(values.signer_name, "No authorized personnel");
    }

    #[test]
    fn overrides_match_case_and_whitespace_insensitively() {
        let table = ClientOverrides::builtin();
        assert!(table.get("costa  bahía").is_some());
        assert!(table.get(" COSTA BAHÍA ").is_some());
        assert!(table.get("Costa Bahia").is_none());

        let (_, client) = fixtures();
        let cfg = table.effective_config(&client);
        assert_eq!(cfg.body_font_size, 12.0);
        assert_eq!(cfg.header_font_size, 18.0);
    }

    #[test]
    fn json_overrides_extend_builtin() {
        let file = ClientOverrides::from_json(r#"{"Hotel Sol": {"showQuantities": false}}"#).unwrap();
        assert_eq!(file.len(), 1);
        let entry = file.get("hotel sol").unwrap();
        let mut cfg = PrintConfiguration::default();
        entry.apply(&mut cfg);
        assert_eq!(cfg.show_quantities, Some(false));
        assert_eq!(cfg.body_font_size, PrintConfiguration::default().body_font_size);

        let missing = ClientOverrides::load(Some("/nonexistent/overrides.json"));
        assert_eq!(missing.len(), ClientOverrides::builtin().len());
    }
}
