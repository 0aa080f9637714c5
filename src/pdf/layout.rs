//! Delivery-ticket layout: invoice data → positioned text, rules and images.
//!
//! The layout is a display list in content space (points, origin at the
//! top-left of the content box, y grows downward). It is split into
//! [`Block`]s of whole rows so the writer can either stack them on one page
//! and scale the result, or paginate them without cutting a row in half.

use std::collections::HashMap;

use crate::models::{Cart, Client, ContentDisplay, Invoice, PrintConfiguration};

/// Raster assets a ticket may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Logo,
    Signature,
}

impl Asset {
    pub fn name(&self) -> &'static str {
        match self {
            Asset::Logo => "logo",
            Asset::Signature => "signature",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
    Center,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// `y` is the baseline, measured from the block top.
    Text {
        x: f32,
        y: f32,
        size: f32,
        bold: bool,
        align: Align,
        text: String,
    },
    Rule {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        width: f32,
    },
    /// `y` is the top edge of the image box.
    Image {
        asset: Asset,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
}

/// A horizontal band of the ticket that is never split across pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub height: f32,
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketLayout {
    pub width: f32,
    pub blocks: Vec<Block>,
}

impl TicketLayout {
    pub fn height(&self) -> f32 {
        self.blocks.iter().map(|b| b.height).sum()
    }

    /// Every asset the layout actually places.
    pub fn assets(&self) -> Vec<Asset> {
        let mut seen = Vec::new();
        for block in &self.blocks {
            for el in &block.elements {
                if let Element::Image { asset, .. } = el {
                    if !seen.contains(asset) {
                        seen.push(*asset);
                    }
                }
            }
        }
        seen
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().flat_map(|b| {
            b.elements.iter().filter_map(|el| match el {
                Element::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
        })
    }
}

/// Width/height ratio of each asset that decoded successfully.
pub type AssetAspects = HashMap<Asset, f32>;

// ============================================================================
// Font metrics
// ============================================================================

/// Helvetica advance widths (1/1000 em) for ASCII 32..=126.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '../
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // 0-9
    278, 278, 584, 584, 584, 556, 1015, // :..@
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // A-M
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // N-Z
    278, 278, 278, 469, 556, 333, // [..`
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // a-m
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // n-z
    334, 260, 334, 584, // {..~
];

/// Approximate rendered width of `text` in points.
///
/// Bold glyphs are treated as 5% wider, which is close enough for
/// right-aligning numbers and centring titles.
pub fn text_width(text: &str, size: f32, bold: bool) -> f32 {
    let units: u32 = text
        .chars()
        .map(|c| {
            let code = c as u32;
            if (32..=126).contains(&code) {
                HELVETICA_WIDTHS[(code - 32) as usize] as u32
            } else {
                556
            }
        })
        .sum();
    let factor = if bold { 1.05 } else { 1.0 };
    units as f32 / 1000.0 * size * factor
}

// ============================================================================
// Builder
// ============================================================================

/// Rows of the summary view: product name, total quantity, total amount.
pub fn summarize_products(carts: &[Cart]) -> Vec<(String, i64, f64)> {
    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, (i64, f64)> = HashMap::new();
    for item in carts.iter().flat_map(|c| c.items.iter()) {
        let entry = totals.entry(item.product_name.clone()).or_insert_with(|| {
            order.push(item.product_name.clone());
            (0, 0.0)
        });
        entry.0 += item.quantity;
        entry.1 += item.amount();
    }
    order
        .into_iter()
        .map(|name| {
            let (qty, amount) = totals.get(&name).copied().unwrap_or_default();
            (name, qty, amount)
        })
        .collect()
}

pub fn format_money(amount: f64) -> String {
    format!("${:.2}", amount)
}

pub fn format_weight(weight: f64) -> String {
    format!("{:.1} lbs", weight)
}

struct Columns {
    product: f32,
    qty_right: f32,
    amount_right: f32,
}

struct LayoutBuilder<'a> {
    config: &'a PrintConfiguration,
    width: f32,
    row: f32,
    blocks: Vec<Block>,
}

impl<'a> LayoutBuilder<'a> {
    fn text_row(&mut self, cells: Vec<(f32, Align, bool, String)>) {
        let size = self.config.body_font_size;
        let elements = cells
            .into_iter()
            .map(|(x, align, bold, text)| Element::Text {
                x,
                y: size * 1.15,
                size,
                bold,
                align,
                text,
            })
            .collect();
        self.blocks.push(Block {
            height: self.row,
            elements,
        });
    }

    fn rule(&mut self, gap: f32) {
        self.blocks.push(Block {
            height: gap,
            elements: vec![Element::Rule {
                x1: 0.0,
                y1: gap / 2.0,
                x2: self.width,
                y2: gap / 2.0,
                width: 0.75,
            }],
        });
    }

    fn spacer(&mut self, height: f32) {
        self.blocks.push(Block {
            height,
            elements: Vec::new(),
        });
    }

    fn columns(&self) -> Columns {
        Columns {
            product: 8.0,
            qty_right: self.width * 0.70,
            amount_right: self.width - 8.0,
        }
    }

    fn header(&mut self, invoice: &Invoice, client: &Client, aspects: &AssetAspects) {
        let cfg = self.config;
        let title = cfg.header_font_size;
        let body = cfg.body_font_size;
        let mut elements = Vec::new();

        let logo_h = cfg.logo_size.height_pt();
        let mut height = title * 1.4 + body * 3.2;
        if let Some(aspect) = aspects.get(&Asset::Logo) {
            let logo_w = (logo_h * aspect).min(self.width / 3.0);
            let logo_h = logo_w / aspect;
            elements.push(Element::Image {
                asset: Asset::Logo,
                x: 0.0,
                y: 0.0,
                width: logo_w,
                height: logo_h,
            });
            height = height.max(logo_h + body);
        } else {
            elements.push(Element::Text {
                x: 0.0,
                y: title * 1.1,
                size: title,
                bold: true,
                align: Align::Left,
                text: "KING UNIFORMS".to_string(),
            });
        }

        elements.push(Element::Text {
            x: self.width,
            y: title * 1.1,
            size: title,
            bold: true,
            align: Align::Right,
            text: "DELIVERY TICKET".to_string(),
        });
        elements.push(Element::Text {
            x: self.width,
            y: title * 1.1 + body * 1.6,
            size: body,
            bold: false,
            align: Align::Right,
            text: format!("Ticket #{}", invoice.display_number()),
        });
        let date = invoice
            .delivery_date
            .unwrap_or_else(|| invoice.created_at.date_naive());
        elements.push(Element::Text {
            x: self.width,
            y: title * 1.1 + body * 3.0,
            size: body,
            bold: false,
            align: Align::Right,
            text: format!("Date: {}", date.format("%m/%d/%Y")),
        });
        self.blocks.push(Block { height, elements });

        self.text_row(vec![(0.0, Align::Left, true, format!("Client: {}", client.name))]);
        if cfg.show_location {
            if let Some(address) = client.address.as_deref().filter(|a| !a.trim().is_empty()) {
                self.text_row(vec![(0.0, Align::Left, false, format!("Address: {}", address))]);
            }
        }
        if let Some(driver) = invoice.driver_name.as_deref() {
            self.text_row(vec![(0.0, Align::Left, false, format!("Driver: {}", driver))]);
        }
        self.rule(body);
    }

    fn table_heading(&mut self) {
        let cols = self.columns();
        let mut cells = vec![(cols.product, Align::Left, true, "Product".to_string())];
        if self.config.quantities_visible() {
            cells.push((cols.qty_right, Align::Right, true, "Qty".to_string()));
        }
        cells.push((cols.amount_right, Align::Right, true, "Amount".to_string()));
        self.text_row(cells);
    }

    fn item_row(&mut self, name: &str, qty: i64, amount: f64) {
        let cols = self.columns();
        let mut cells = vec![(cols.product, Align::Left, false, name.to_string())];
        if self.config.quantities_visible() {
            cells.push((cols.qty_right, Align::Right, false, qty.to_string()));
        }
        cells.push((cols.amount_right, Align::Right, false, format_money(amount)));
        self.text_row(cells);
    }

    fn detailed(&mut self, invoice: &Invoice) {
        self.table_heading();
        for cart in &invoice.carts {
            let mut cells = vec![(0.0, Align::Left, true, cart.name.clone())];
            if self.config.quantities_visible() {
                cells.push((
                    self.columns().qty_right,
                    Align::Right,
                    true,
                    cart.quantity().to_string(),
                ));
            }
            self.text_row(cells);
            for item in &cart.items {
                self.item_row(&item.product_name, item.quantity, item.amount());
            }
        }
    }

    fn summary(&mut self, invoice: &Invoice) {
        self.table_heading();
        for (name, qty, amount) in summarize_products(&invoice.carts) {
            self.item_row(&name, qty, amount);
        }
    }

    fn totals(&mut self, invoice: &Invoice) {
        let cfg = self.config;
        self.rule(cfg.body_font_size);
        let right = self.columns().amount_right;
        if cfg.content_display == ContentDisplay::WeightOnly {
            self.text_row(vec![
                (0.0, Align::Left, true, "Total weight".to_string()),
                (right, Align::Right, true, format_weight(invoice.total_weight)),
            ]);
            return;
        }
        if cfg.quantities_visible() {
            self.text_row(vec![
                (0.0, Align::Left, false, "Total pieces".to_string()),
                (right, Align::Right, false, invoice.total_quantity().to_string()),
            ]);
        }
        if invoice.total_weight > 0.0 {
            self.text_row(vec![
                (0.0, Align::Left, false, "Total weight".to_string()),
                (right, Align::Right, false, format_weight(invoice.total_weight)),
            ]);
        }
        self.text_row(vec![
            (0.0, Align::Left, true, "Total".to_string()),
            (right, Align::Right, true, format_money(invoice.total_price())),
        ]);
    }

    fn signature(&mut self, invoice: &Invoice, aspects: &AssetAspects) {
        let Some(sig) = invoice.signature.as_ref() else {
            return;
        };
        let body = self.config.body_font_size;
        self.spacer(body);

        let mut elements = Vec::new();
        let mut top = 0.0;
        if let Some(aspect) = aspects.get(&Asset::Signature) {
            let h = 48.0_f32;
            let w = (h * aspect).min(self.width / 2.0);
            let h = w / aspect;
            elements.push(Element::Image {
                asset: Asset::Signature,
                x: 0.0,
                y: 0.0,
                width: w,
                height: h,
            });
            top = h + 2.0;
        }
        elements.push(Element::Rule {
            x1: 0.0,
            y1: top,
            x2: self.width / 2.0,
            y2: top,
            width: 0.5,
        });
        elements.push(Element::Text {
            x: 0.0,
            y: top + body * 1.3,
            size: body,
            bold: false,
            align: Align::Left,
            text: format!("Received by: {}", sig.display_name()),
        });
        let mut height = top + body * 1.8;
        if let Some(at) = sig.signed_at {
            elements.push(Element::Text {
                x: 0.0,
                y: top + body * 2.8,
                size: body,
                bold: false,
                align: Align::Left,
                text: format!("Signed: {}", at.format("%m/%d/%Y %I:%M %p")),
            });
            height += body * 1.2;
        }
        self.blocks.push(Block { height, elements });
    }

    fn timestamp(&mut self, invoice: &Invoice) {
        let size = (self.config.body_font_size * 0.8).max(6.0);
        self.spacer(size);
        self.blocks.push(Block {
            height: size * 1.6,
            elements: vec![Element::Text {
                x: self.width / 2.0,
                y: size * 1.1,
                size,
                bold: false,
                align: Align::Center,
                text: format!(
                    "Logged {} UTC",
                    invoice.created_at.format("%m/%d/%Y %H:%M")
                ),
            }],
        });
    }
}

/// Lay out a delivery ticket for a content box `width` points wide.
///
/// Only assets present in `aspects` are placed; a missing logo falls back to
/// the company name in text.
pub fn build_ticket(
    invoice: &Invoice,
    client: &Client,
    config: &PrintConfiguration,
    width: f32,
    aspects: &AssetAspects,
) -> TicketLayout {
    let mut b = LayoutBuilder {
        config,
        width,
        row: config.body_font_size * 1.6,
        blocks: Vec::new(),
    };

    b.header(invoice, client, aspects);
    match config.content_display {
        ContentDisplay::Detailed => b.detailed(invoice),
        ContentDisplay::Summary => b.summary(invoice),
        ContentDisplay::WeightOnly => {}
    }
    b.totals(invoice);
    if config.show_signatures {
        b.signature(invoice, aspects);
    }
    if config.show_timestamp {
        b.timestamp(invoice);
    }

    TicketLayout {
        width,
        blocks: b.blocks,
    }
}
