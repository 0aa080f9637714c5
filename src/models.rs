//! Domain models for the invoice mailer.
//!
//! Invoices and clients are documents owned by the operations app; this
//! service reads them and writes back only the [`EmailStatus`] sub-document.
//! Field names serialise in camelCase to match the stored documents and the
//! JSON bodies the web client already sends.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Invoice, Cart, Item
// ============================================================================

/// Lifecycle of an invoice. Once `Shipped`, only email/audit metadata changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Approved,
    Shipped,
    Delivered,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Approved => "approved",
            InvoiceStatus::Shipped => "shipped",
            InvoiceStatus::Delivered => "delivered",
        }
    }
}

/// One product line inside a cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub product_name: String,
    pub quantity: i64,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl Item {
    pub fn amount(&self) -> f64 {
        self.unit_price * self.quantity as f64
    }
}

/// A named grouping of items within an invoice ("Cart 1", "ABC123", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub name: String,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Cart {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, product: &str, quantity: i64, unit_price: f64) -> Self {
        self.items.push(Item {
            product_name: product.to_string(),
            quantity,
            unit_price,
            weight: None,
        });
        self
    }

    pub fn total(&self) -> f64 {
        self.items.iter().map(Item::amount).sum()
    }

    pub fn quantity(&self) -> i64 {
        self.items.iter().map(|i| i.quantity).sum()
    }
}

/// Canonical form of a cart name used for uniqueness checks.
///
/// Case-insensitive and whitespace-free, so `"ABC123"`, `"abc 123"` and
/// `" Abc\t123 "` all collide.
pub fn normalize_cart_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Who signed for the delivery, if anyone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    #[serde(default)]
    pub signer_name: Option<String>,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    /// Set when the driver recorded that nobody was available to sign.
    #[serde(default)]
    pub no_authorized_personnel: bool,
    /// Captured signature stroke image (PNG/JPEG, base64 or data URI).
    #[serde(default)]
    pub image_base64: Option<String>,
}

impl Signature {
    pub fn display_name(&self) -> String {
        if self.no_authorized_personnel {
            return "No authorized personnel".to_string();
        }
        self.signer_name.clone().unwrap_or_default()
    }
}

/// One laundry/delivery transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub invoice_number: Option<String>,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_carts")]
    pub carts: Vec<Cart>,
    #[serde(default)]
    pub total_weight: f64,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default)]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub delivery_date: Option<NaiveDate>,
    #[serde(default)]
    pub email_status: EmailStatus,
}

impl Invoice {
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            invoice_number: None,
            client_id: client_id.into(),
            created_at,
            carts: Vec::new(),
            total_weight: 0.0,
            status: InvoiceStatus::default(),
            signature: None,
            driver_name: None,
            delivery_date: None,
            email_status: EmailStatus::default(),
        }
    }

    /// Number shown on the ticket; falls back to the document id.
    pub fn display_number(&self) -> &str {
        self.invoice_number.as_deref().unwrap_or(&self.id)
    }

    pub fn total_price(&self) -> f64 {
        self.carts.iter().map(Cart::total).sum()
    }

    pub fn total_quantity(&self) -> i64 {
        self.carts.iter().map(Cart::quantity).sum()
    }

    /// Add a cart, merging it into an existing cart whose name collides.
    ///
    /// Returns `true` when a merge happened. The existing spelling is kept.
    pub fn add_cart(&mut self, cart: Cart) -> bool {
        merge_cart(&mut self.carts, cart)
    }

    /// Rename the cart at `index`, suffixing `(2)`, `(3)`, ... when the new
    /// name collides with another cart. Returns the name actually applied.
    pub fn rename_cart(&mut self, index: usize, new_name: &str) -> Option<String> {
        if index >= self.carts.len() {
            return None;
        }
        let taken: Vec<String> = self
            .carts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, c)| normalize_cart_name(&c.name))
            .collect();

        let base = new_name.trim().to_string();
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&normalize_cart_name(&candidate)) {
            candidate = format!("{} ({})", base, n);
            n += 1;
        }
        self.carts[index].name = candidate.clone();
        Some(candidate)
    }
}

fn merge_cart(carts: &mut Vec<Cart>, cart: Cart) -> bool {
    let key = normalize_cart_name(&cart.name);
    match carts.iter_mut().find(|c| normalize_cart_name(&c.name) == key) {
        Some(existing) => {
            existing.items.extend(cart.items);
            true
        }
        None => {
            carts.push(cart);
            false
        }
    }
}

/// Stored documents and request bodies may carry carts whose names collide;
/// they are folded together on the way in.
fn deserialize_carts<'de, D>(deserializer: D) -> Result<Vec<Cart>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<Cart>::deserialize(deserializer)?;
    let mut carts = Vec::with_capacity(raw.len());
    for cart in raw {
        merge_cart(&mut carts, cart);
    }
    Ok(carts)
}

// ============================================================================
// Client and PrintConfiguration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperSize {
    #[default]
    Letter,
    A4,
    Legal,
}

impl PaperSize {
    pub const ALL: [PaperSize; 3] = [PaperSize::Letter, PaperSize::A4, PaperSize::Legal];

    /// Portrait dimensions in points (1/72 in).
    pub fn dimensions_pt(&self) -> (f32, f32) {
        match self {
            PaperSize::Letter => (612.0, 792.0),
            PaperSize::A4 => (595.28, 841.89),
            PaperSize::Legal => (612.0, 1008.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginPreset {
    Narrow,
    #[default]
    Normal,
    Wide,
}

impl MarginPreset {
    pub fn points(&self) -> f32 {
        match self {
            MarginPreset::Narrow => 18.0,
            MarginPreset::Normal => 36.0,
            MarginPreset::Wide => 54.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentDisplay {
    /// Every item row of every cart.
    #[default]
    Detailed,
    /// Per-product subtotals across all carts.
    Summary,
    /// No item rows; aggregate weight only.
    WeightOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pagination {
    #[default]
    SinglePageCompressed,
    MultiPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogoSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl LogoSize {
    /// Logo box height in points.
    pub fn height_pt(&self) -> f32 {
        match self {
            LogoSize::Small => 36.0,
            LogoSize::Medium => 54.0,
            LogoSize::Large => 80.0,
        }
    }
}

/// Per-client PDF layout and email template settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrintConfiguration {
    pub paper_size: PaperSize,
    pub orientation: Orientation,
    pub scale: f32,
    pub margins: MarginPreset,
    pub content_display: ContentDisplay,
    pub pagination: Pagination,
    pub show_signatures: bool,
    pub show_timestamp: bool,
    pub show_location: bool,
    pub show_watermark: bool,
    pub show_border: bool,
    pub header_font_size: f32,
    pub body_font_size: f32,
    pub logo_size: LogoSize,
    /// Overrides whether quantity columns are printed. `None` uses the
    /// content-display default.
    pub show_quantities: Option<bool>,
    pub email_subject_template: Option<String>,
    pub email_body_template: Option<String>,
}

impl Default for PrintConfiguration {
    fn default() -> Self {
        Self {
            paper_size: PaperSize::Letter,
            orientation: Orientation::Portrait,
            scale: 1.0,
            margins: MarginPreset::Normal,
            content_display: ContentDisplay::Detailed,
            pagination: Pagination::SinglePageCompressed,
            show_signatures: true,
            show_timestamp: true,
            show_location: false,
            show_watermark: false,
            show_border: false,
            header_font_size: 16.0,
            body_font_size: 10.0,
            logo_size: LogoSize::Medium,
            show_quantities: None,
            email_subject_template: None,
            email_body_template: None,
        }
    }
}

impl PrintConfiguration {
    /// Page dimensions in points after applying orientation.
    pub fn page_size_pt(&self) -> (f32, f32) {
        let (w, h) = self.paper_size.dimensions_pt();
        match self.orientation {
            Orientation::Portrait => (w, h),
            Orientation::Landscape => (h, w),
        }
    }

    pub fn quantities_visible(&self) -> bool {
        self.show_quantities
            .unwrap_or(self.content_display != ContentDisplay::WeightOnly)
    }
}

/// A billing/delivery entity. Deleting a client never cascades to invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub cc_emails: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub logo_base64: Option<String>,
    #[serde(default)]
    pub print_config: PrintConfiguration,
}

// ============================================================================
// EmailStatus
// ============================================================================

/// The event that caused an email to be sent, highest display priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailTrigger {
    Shipping,
    Signature,
    Automatic,
    Manual,
    Approval,
}

impl EmailTrigger {
    pub const BY_PRIORITY: [EmailTrigger; 5] = [
        EmailTrigger::Shipping,
        EmailTrigger::Signature,
        EmailTrigger::Automatic,
        EmailTrigger::Manual,
        EmailTrigger::Approval,
    ];
}

/// Per-invoice record of which send pathways fired and when.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailStatus {
    pub shipping_email_sent: bool,
    pub shipping_email_sent_at: Option<DateTime<Utc>>,
    pub signature_email_sent: bool,
    pub signature_email_sent_at: Option<DateTime<Utc>>,
    pub automatic_email_sent: bool,
    pub automatic_email_sent_at: Option<DateTime<Utc>>,
    pub manual_email_sent: bool,
    pub manual_email_sent_at: Option<DateTime<Utc>>,
    pub approval_email_sent: bool,
    pub approval_email_sent_at: Option<DateTime<Utc>>,
    pub last_email_error: Option<String>,
    pub last_compression_level: Option<String>,
    pub last_recipients: Vec<String>,
}

impl EmailStatus {
    pub fn is_sent(&self, trigger: EmailTrigger) -> bool {
        match trigger {
            EmailTrigger::Shipping => self.shipping_email_sent,
            EmailTrigger::Signature => self.signature_email_sent,
            EmailTrigger::Automatic => self.automatic_email_sent,
            EmailTrigger::Manual => self.manual_email_sent,
            EmailTrigger::Approval => self.approval_email_sent,
        }
    }

    fn mark_sent(&mut self, trigger: EmailTrigger, at: DateTime<Utc>) {
        let (flag, stamp) = match trigger {
            EmailTrigger::Shipping => (&mut self.shipping_email_sent, &mut self.shipping_email_sent_at),
            EmailTrigger::Signature => (&mut self.signature_email_sent, &mut self.signature_email_sent_at),
            EmailTrigger::Automatic => (&mut self.automatic_email_sent, &mut self.automatic_email_sent_at),
            EmailTrigger::Manual => (&mut self.manual_email_sent, &mut self.manual_email_sent_at),
            EmailTrigger::Approval => (&mut self.approval_email_sent, &mut self.approval_email_sent_at),
        };
        *flag = true;
        *stamp = Some(at);
    }

    /// Highest-priority trigger that has fired, `None` when nothing was sent.
    pub fn display_trigger(&self) -> Option<EmailTrigger> {
        EmailTrigger::BY_PRIORITY
            .into_iter()
            .find(|t| self.is_sent(*t))
    }

    /// Apply the outcome of one send attempt.
    ///
    /// Success marks the trigger and clears the last error; failure only
    /// records the error so earlier successful sends stay visible.
    pub fn record(&mut self, trigger: EmailTrigger, outcome: &SendOutcome, at: DateTime<Utc>) {
        match &outcome.error {
            None => {
                self.mark_sent(trigger, at);
                self.last_email_error = None;
                self.last_recipients = outcome.recipients.clone();
            }
            Some(err) => {
                self.last_email_error = Some(err.clone());
            }
        }
        if let Some(level) = &outcome.compression_level {
            self.last_compression_level = Some(level.clone());
        }
    }
}

/// Minimal description of a finished send, used to update [`EmailStatus`].
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub recipients: Vec<String>,
    pub compression_level: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// Request Models (Deserialize from JSON input)
// ============================================================================

/// Body of `POST /api/send-invoice`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInvoiceRequest {
    #[serde(default)]
    pub to: Option<Recipients>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub pdf_base64: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
}

/// Body of `POST /api/send-test-email`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTestEmailRequest {
    #[serde(default)]
    pub to: Option<Recipients>,
    #[serde(default)]
    pub cc: Option<Recipients>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub pdf_base64: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
}

/// Body of `POST /api/invoices/{id}/send`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendInvoiceRequest {
    #[serde(default)]
    pub trigger: Option<EmailTrigger>,
    #[serde(default)]
    pub to: Option<Recipients>,
    #[serde(default)]
    pub cc: Option<Recipients>,
}

/// Body of `POST /api/render-preview`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPreviewRequest {
    pub invoice: Invoice,
    pub client: Client,
}

/// Recipient field that accepts a single address, a comma-separated list, or
/// a JSON array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn into_list(self) -> Vec<String> {
        let raw = match self {
            Recipients::One(s) => vec![s],
            Recipients::Many(v) => v,
        };
        raw.iter()
            .flat_map(|s| s.split([',', ';']))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Response Models
// ============================================================================

/// Body of `GET /api/invoices/{id}/email-status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStatusResponse {
    pub data: EmailStatus,
    pub display_trigger: Option<EmailTrigger>,
}

impl From<EmailStatus> for EmailStatusResponse {
    fn from(status: EmailStatus) -> Self {
        Self {
            display_trigger: status.display_trigger(),
            data: status,
        }
    }
}
