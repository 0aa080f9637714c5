//! Ticket rendering: layout → PDF bytes via lopdf.
//!
//! Text is written with the standard Helvetica fonts, so the only raster
//! content is the logo and the captured signature. Those are resampled to the
//! requested DPI for the size they occupy on the page and embedded as JPEG.
//! Lowering that DPI/quality is what the compressor does later on.
//!
//! Rendering is CPU-bound; [`render_ticket_async`] moves it onto the blocking
//! pool and bounds it with a timeout.

use std::time::Duration;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};
use tracing::{debug, info, warn};

use crate::error::PdfError;
use crate::models::{Client, Invoice, Pagination, PrintConfiguration};
use crate::pdf::encoding::{decode_base64, encode_base64};
use crate::pdf::layout::{build_ticket, text_width, Align, Asset, AssetAspects, Block, Element};

/// Raster settings for embedded images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterOptions {
    pub dpi: f32,
    pub jpeg_quality: u8,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            dpi: 200.0,
            jpeg_quality: 90,
        }
    }
}

/// Result of one render.
#[derive(Debug, Clone)]
pub struct RenderedPdf {
    pub base64: String,
    /// Decoded byte size.
    pub byte_len: usize,
    pub page_count: usize,
    /// Assets that failed to decode and were left out.
    pub omitted_assets: Vec<String>,
}

// ============================================================================
// Placement
// ============================================================================

/// Where scaled content lands on a page, in points from the bottom-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl Placement {
    /// Left, right, top and bottom margins around the content.
    pub fn margins(&self, page_w: f32, page_h: f32) -> (f32, f32, f32, f32) {
        let left = self.x;
        let right = page_w - self.x - self.width;
        let bottom = self.y;
        let top = page_h - self.y - self.height;
        (left, right, top, bottom)
    }
}

/// Round to 1/100 pt so repeated renders land on identical coordinates.
fn round_pt(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

/// Scale content to fit the printable area (never enlarging past
/// `max_scale`, never cropping) and centre it on the page.
///
/// Offsets are `(page − content) / 2` on both axes.
pub fn fit_and_center(
    page: (f32, f32),
    content: (f32, f32),
    margin: f32,
    max_scale: f32,
) -> Placement {
    let (page_w, page_h) = page;
    let (content_w, content_h) = content;
    let avail_w = (page_w - 2.0 * margin).max(1.0);
    let avail_h = (page_h - 2.0 * margin).max(1.0);

    let fit = (avail_w / content_w.max(1.0)).min(avail_h / content_h.max(1.0));
    let scale = max_scale.min(fit);

    let width = round_pt(content_w * scale);
    let height = round_pt(content_h * scale);
    Placement {
        x: round_pt((page_w - width) / 2.0),
        y: round_pt((page_h - height) / 2.0),
        width,
        height,
        scale,
    }
}

/// Split blocks into pages of at most `avail_h` content points each.
///
/// A block taller than a page gets a page of its own.
pub fn paginate(blocks: &[Block], avail_h: f32) -> Vec<Vec<&Block>> {
    let mut pages: Vec<Vec<&Block>> = Vec::new();
    let mut current: Vec<&Block> = Vec::new();
    let mut used = 0.0;
    for block in blocks {
        if !current.is_empty() && used + block.height > avail_h {
            pages.push(std::mem::take(&mut current));
            used = 0.0;
        }
        used += block.height;
        current.push(block);
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(current);
    }
    pages
}

// ============================================================================
// Assets
// ============================================================================

struct LoadedAssets {
    images: Vec<(Asset, DynamicImage)>,
    omitted: Vec<String>,
}

impl LoadedAssets {
    fn aspects(&self) -> AssetAspects {
        self.images
            .iter()
            .map(|(asset, img)| (*asset, img.width() as f32 / img.height().max(1) as f32))
            .collect()
    }

    fn get(&self, asset: Asset) -> Option<&DynamicImage> {
        self.images.iter().find(|(a, _)| *a == asset).map(|(_, img)| img)
    }
}

fn decode_image(data: &str) -> Result<DynamicImage, String> {
    let bytes = decode_base64(data).map_err(|e| e.to_string())?;
    let img = image::load_from_memory(&bytes).map_err(|e| e.to_string())?;
    if img.width() == 0 || img.height() == 0 {
        return Err("image has zero size".to_string());
    }
    Ok(img)
}

fn load_assets(invoice: &Invoice, client: &Client, config: &PrintConfiguration) -> LoadedAssets {
    let mut loaded = LoadedAssets {
        images: Vec::new(),
        omitted: Vec::new(),
    };
    let signature = invoice
        .signature
        .as_ref()
        .filter(|_| config.show_signatures)
        .and_then(|s| s.image_base64.as_deref());
    let sources = [
        (Asset::Logo, client.logo_base64.as_deref()),
        (Asset::Signature, signature),
    ];
    for (asset, source) in sources {
        let Some(data) = source.filter(|d| !d.trim().is_empty()) else {
            continue;
        };
        match decode_image(data) {
            Ok(img) => loaded.images.push((asset, img)),
            Err(e) => {
                warn!(
                    "Omitting {} from ticket {}: {}",
                    asset.name(),
                    invoice.display_number(),
                    e
                );
                loaded.omitted.push(asset.name().to_string());
            }
        }
    }
    loaded
}

/// Composite onto white; JPEG has no alpha channel.
pub(crate) fn flatten_to_rgb(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (src, dst) in rgba.pixels().zip(out.pixels_mut()) {
        let a = src[3] as u32;
        for c in 0..3 {
            dst[c] = ((src[c] as u32 * a + 255 * (255 - a)) / 255) as u8;
        }
    }
    out
}

pub(crate) fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality).encode_image(img)?;
    Ok(buf)
}

pub(crate) fn jpeg_xobject(img: &RgbImage, quality: u8) -> Result<Stream, PdfError> {
    let jpeg = encode_jpeg(img, quality).map_err(|e| PdfError::Write(e.to_string()))?;
    let mut stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img.width() as i64,
            "Height" => img.height() as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    );
    stream.allows_compression = false;
    Ok(stream)
}

/// Largest displayed size (points) of each asset across the layout.
fn displayed_sizes(blocks: &[Block], scale: f32) -> Vec<(Asset, f32, f32)> {
    let mut sizes: Vec<(Asset, f32, f32)> = Vec::new();
    for el in blocks.iter().flat_map(|b| b.elements.iter()) {
        if let Element::Image {
            asset,
            width,
            height,
            ..
        } = el
        {
            let (w, h) = (width * scale, height * scale);
            match sizes.iter_mut().find(|(a, _, _)| a == asset) {
                Some(entry) => {
                    entry.1 = entry.1.max(w);
                    entry.2 = entry.2.max(h);
                }
                None => sizes.push((*asset, w, h)),
            }
        }
    }
    sizes
}

/// Resample `img` to `dpi` for a box of `w_pt` × `h_pt`, never upsampling.
fn rasterize(img: &DynamicImage, w_pt: f32, h_pt: f32, dpi: f32) -> RgbImage {
    let target_w = ((w_pt / 72.0 * dpi).round() as u32).clamp(1, img.width());
    let target_h = ((h_pt / 72.0 * dpi).round() as u32).clamp(1, img.height());
    let rgb = flatten_to_rgb(img);
    if target_w == rgb.width() && target_h == rgb.height() {
        return rgb;
    }
    image::imageops::resize(&rgb, target_w, target_h, FilterType::Triangle)
}

// ============================================================================
// Content stream
// ============================================================================

/// Map text to WinAnsi bytes for the standard fonts; unmappable chars become `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c as u32 {
            0x20..=0x7e | 0xa0..=0xff => c as u32 as u8,
            0x2019 => 0x92,
            0x201c => 0x93,
            0x201d => 0x94,
            0x2013 => 0x96,
            0x2014 => 0x97,
            _ => b'?',
        })
        .collect()
}

fn op(name: &str, operands: Vec<Object>) -> Operation {
    Operation::new(name, operands)
}

struct PageOps {
    ops: Vec<Operation>,
}

impl PageOps {
    fn new() -> Self {
        Self { ops: Vec::new() }
    }

    fn text(&mut self, font: &str, size: f32, x: f32, y: f32, text: &str) {
        self.ops.push(op("BT", vec![]));
        self.ops.push(op("Tf", vec![font.into(), size.into()]));
        self.ops.push(op("Td", vec![x.into(), y.into()]));
        self.ops.push(op(
            "Tj",
            vec![Object::String(win_ansi(text), StringFormat::Literal)],
        ));
        self.ops.push(op("ET", vec![]));
    }

    fn line(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, width: f32) {
        self.ops.push(op("w", vec![width.into()]));
        self.ops.push(op("m", vec![x1.into(), y1.into()]));
        self.ops.push(op("l", vec![x2.into(), y2.into()]));
        self.ops.push(op("S", vec![]));
    }

    /// Draw blocks stacked from the top of a content box `height` tall whose
    /// bottom-left is the current origin.
    fn blocks(&mut self, blocks: &[&Block], height: f32) {
        let mut top = 0.0;
        for block in blocks {
            for el in &block.elements {
                self.element(el, top, height);
            }
            top += block.height;
        }
    }

    fn element(&mut self, el: &Element, top: f32, height: f32) {
        match el {
            Element::Text {
                x,
                y,
                size,
                bold,
                align,
                text,
            } => {
                let w = text_width(text, *size, *bold);
                let left = match align {
                    Align::Left => *x,
                    Align::Right => x - w,
                    Align::Center => x - w / 2.0,
                };
                let font = if *bold { "F2" } else { "F1" };
                self.text(font, *size, left, height - (top + y), text);
            }
            Element::Rule {
                x1,
                y1,
                x2,
                y2,
                width,
            } => self.line(*x1, height - (top + y1), *x2, height - (top + y2), *width),
            Element::Image {
                asset,
                x,
                y,
                width,
                height: h,
            } => {
                let bottom = height - (top + y + h);
                self.ops.push(op("q", vec![]));
                self.ops.push(op(
                    "cm",
                    vec![
                        (*width).into(),
                        0.into(),
                        0.into(),
                        (*h).into(),
                        (*x).into(),
                        bottom.into(),
                    ],
                ));
                self.ops.push(op("Do", vec![xobject_name(*asset).into()]));
                self.ops.push(op("Q", vec![]));
            }
        }
    }

    fn begin_content(&mut self, placement: &Placement) {
        self.ops.push(op("q", vec![]));
        self.ops.push(op(
            "cm",
            vec![
                placement.scale.into(),
                0.into(),
                0.into(),
                placement.scale.into(),
                placement.x.into(),
                placement.y.into(),
            ],
        ));
        self.ops.push(op("g", vec![0.into()]));
    }

    fn end_content(&mut self) {
        self.ops.push(op("Q", vec![]));
    }

    fn border(&mut self, placement: &Placement) {
        let pad = 6.0;
        self.ops.push(op("w", vec![1.0_f32.into()]));
        self.ops.push(op(
            "re",
            vec![
                (placement.x - pad).into(),
                (placement.y - pad).into(),
                (placement.width + 2.0 * pad).into(),
                (placement.height + 2.0 * pad).into(),
            ],
        ));
        self.ops.push(op("S", vec![]));
    }

    fn watermark(&mut self, text: &str, page_w: f32, page_h: f32) {
        let size = (page_w.min(page_h) / 7.0).round();
        let w = text_width(text, size, true);
        let (sin, cos) = std::f32::consts::FRAC_PI_4.sin_cos();
        // Start point so the rotated baseline's midpoint sits at the page centre.
        let x = page_w / 2.0 - cos * w / 2.0 + sin * size / 3.0;
        let y = page_h / 2.0 - sin * w / 2.0 - cos * size / 3.0;
        self.ops.push(op("q", vec![]));
        self.ops.push(op("g", vec![0.88_f32.into()]));
        self.ops.push(op("BT", vec![]));
        self.ops.push(op("Tf", vec!["F2".into(), size.into()]));
        self.ops.push(op(
            "Tm",
            vec![
                cos.into(),
                sin.into(),
                (-sin).into(),
                cos.into(),
                x.into(),
                y.into(),
            ],
        ));
        self.ops.push(op(
            "Tj",
            vec![Object::String(win_ansi(text), StringFormat::Literal)],
        ));
        self.ops.push(op("ET", vec![]));
        self.ops.push(op("Q", vec![]));
    }
}

fn xobject_name(asset: Asset) -> &'static str {
    match asset {
        Asset::Logo => "ImLogo",
        Asset::Signature => "ImSig",
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Render an invoice as a delivery-ticket PDF.
///
/// Assets that fail to decode are left out and listed in
/// [`RenderedPdf::omitted_assets`]; they never fail the render.
pub fn render_ticket(
    invoice: &Invoice,
    client: &Client,
    config: &PrintConfiguration,
    raster: RasterOptions,
) -> Result<RenderedPdf, PdfError> {
    let (page_w, page_h) = config.page_size_pt();
    let margin = config.margins.points();
    let content_w = page_w - 2.0 * margin;
    let max_scale = config.scale.clamp(0.5, 2.0);

    let assets = load_assets(invoice, client, config);
    let layout = build_ticket(invoice, client, config, content_w, &assets.aspects());

    // (blocks on the page, placement of the content box)
    let pages: Vec<(Vec<&Block>, Placement)> = match config.pagination {
        Pagination::SinglePageCompressed => {
            let placement =
                fit_and_center((page_w, page_h), (layout.width, layout.height()), margin, max_scale);
            if placement.scale < max_scale {
                debug!(
                    "Ticket {} scaled to {:.3} to fit one page",
                    invoice.display_number(),
                    placement.scale
                );
            }
            vec![(layout.blocks.iter().collect(), placement)]
        }
        Pagination::MultiPage => {
            let scale = max_scale.min((page_w - 2.0 * margin) / layout.width);
            let avail_h = (page_h - 2.0 * margin) / scale;
            paginate(&layout.blocks, avail_h)
                .into_iter()
                .map(|blocks| {
                    let h: f32 = blocks.iter().map(|b| b.height).sum();
                    let width = round_pt(layout.width * scale);
                    let height = round_pt(h * scale);
                    let placement = Placement {
                        x: round_pt((page_w - width) / 2.0),
                        y: round_pt(page_h - margin - height),
                        width,
                        height,
                        scale,
                    };
                    (blocks, placement)
                })
                .collect()
        }
    };

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let regular = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });

    let min_scale = pages
        .iter()
        .map(|(_, p)| p.scale)
        .fold(f32::INFINITY, f32::min);
    let mut xobjects = lopdf::Dictionary::new();
    for (asset, w_pt, h_pt) in displayed_sizes(&layout.blocks, min_scale) {
        let Some(img) = assets.get(asset) else {
            continue;
        };
        let raster_img = rasterize(img, w_pt, h_pt, raster.dpi);
        let id = doc.add_object(jpeg_xobject(&raster_img, raster.jpeg_quality)?);
        xobjects.set(xobject_name(asset), id);
    }

    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => regular, "F2" => bold },
        "XObject" => xobjects,
    });

    let watermark = invoice.status.as_str().to_uppercase();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for (blocks, placement) in &pages {
        let mut ops = PageOps::new();
        if config.show_watermark {
            ops.watermark(&watermark, page_w, page_h);
        }
        if config.show_border {
            ops.border(placement);
        }
        ops.begin_content(placement);
        ops.blocks(blocks, placement.height / placement.scale);
        ops.end_content();

        let content = Content { operations: ops.ops }
            .encode()
            .map_err(|e| PdfError::Write(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id: ObjectId = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let page_count = kids.len();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), page_w.into(), page_h.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| PdfError::Write(e.to_string()))?;

    info!(
        "Rendered ticket {}: {} page(s), {} bytes, {} asset(s) omitted",
        invoice.display_number(),
        page_count,
        bytes.len(),
        assets.omitted.len()
    );

    Ok(RenderedPdf {
        base64: encode_base64(&bytes),
        byte_len: bytes.len(),
        page_count,
        omitted_assets: assets.omitted,
    })
}

/// Render on the blocking pool, bounded by `timeout`.
pub async fn render_ticket_async(
    invoice: Invoice,
    client: Client,
    config: PrintConfiguration,
    raster: RasterOptions,
    timeout: Duration,
) -> Result<RenderedPdf, PdfError> {
    let task = tokio::task::spawn_blocking(move || render_ticket(&invoice, &client, &config, raster));
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| PdfError::Internal(format!("Render task panicked: {}", e)))?,
        Err(_) => Err(PdfError::RenderTimeout {
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Cart, ContentDisplay, MarginPreset, Orientation, PaperSize, Signature};
    use crate::pdf::encoding::decode_pdf;
    use chrono::{TimeZone, Utc};
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn png_base64(w: u32, h: u32) -> String {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        encode_base64(&buf)
    }

    pub(crate) fn sample_invoice(carts: usize) -> Invoice {
        let mut invoice = Invoice::new("inv-1", "c-1", Utc.with_ymd_and_hms(2025, 6, 9, 7, 45, 0).unwrap());
        invoice.invoice_number = Some("2001".into());
        invoice.total_weight = 95.0;
        for i in 0..carts {
            invoice.add_cart(
                Cart::new(format!("Cart {}", i + 1))
                    .with_item("Towels", 12, 0.45)
                    .with_item("Pillow Cases", 6, 0.30),
            );
        }
        invoice.signature = Some(Signature {
            signer_name: Some("Ana Ruiz".into()),
            signed_at: Some(Utc.with_ymd_and_hms(2025, 6, 9, 9, 0, 0).unwrap()),
            ..Default::default()
        });
        invoice
    }

    pub(crate) fn sample_client() -> Client {
        Client {
            id: "c-1".into(),
            name: "Costa Bahía".into(),
            email: Some("frontdesk@costabahia.example".into()),
            cc_emails: vec![],
            address: None,
            logo_base64: None,
            print_config: PrintConfiguration::default(),
        }
    }

    #[test]
    fn centering_holds_for_every_paper_size() {
        for paper in PaperSize::ALL {
            for content in [(540.0, 300.0), (540.0, 2400.0), (200.0, 100.0), (577.3, 913.7)] {
                let (w, h) = paper.dimensions_pt();
                let p = fit_and_center((w, h), content, 36.0, 1.0);
                let (left, right, top, bottom) = p.margins(w, h);
                assert!((left - right).abs() < 1.0, "{:?} {:?}: {} vs {}", paper, content, left, right);
                assert!((top - bottom).abs() < 1.0, "{:?} {:?}: {} vs {}", paper, content, top, bottom);
                assert!(p.width <= w - 72.0 + 0.01 && p.height <= h - 72.0 + 0.01);
            }
        }
    }

    fn number(obj: &Object) -> f32 {
        match obj {
            Object::Integer(i) => *i as f32,
            Object::Real(r) => *r,
            other => panic!("not a number: {:?}", other),
        }
    }

    /// Page size from the MediaBox and the content transform of the first page.
    fn rendered_placement(base64: &str) -> ((f32, f32), [f32; 6]) {
        let doc = Document::load_mem(&decode_pdf(base64).unwrap()).unwrap();
        let pages_id = doc.catalog().unwrap().get(b"Pages").unwrap().as_reference().unwrap();
        let media_box = doc.get_dictionary(pages_id).unwrap().get(b"MediaBox").unwrap().as_array().unwrap();
        let page = (number(&media_box[2]), number(&media_box[3]));

        let page_id = *doc.get_pages().get(&1).unwrap();
        let content = Content::decode(&doc.get_page_content(page_id).unwrap()).unwrap();
        let cm = content.operations.iter().find(|op| op.operator == "cm").unwrap();
        let mut m = [0.0; 6];
        for (slot, operand) in m.iter_mut().zip(&cm.operands) {
            *slot = number(operand);
        }
        (page, m)
    }

    #[test]
    fn rendered_ticket_is_centred_on_every_page_setup() {
        for carts in [2, 40] {
            let invoice = sample_invoice(carts);
            for paper in PaperSize::ALL {
                for orientation in [Orientation::Portrait, Orientation::Landscape] {
                    for margins in [MarginPreset::Narrow, MarginPreset::Normal, MarginPreset::Wide] {
                        let mut client = sample_client();
                        let cfg = &mut client.print_config;
                        cfg.paper_size = paper;
                        cfg.orientation = orientation;
                        cfg.margins = margins;
                        cfg.pagination = Pagination::SinglePageCompressed;
                        cfg.show_watermark = false;
                        cfg.show_border = false;
                        let cfg = client.print_config.clone();

                        let out = render_ticket(&invoice, &client, &cfg, RasterOptions::default()).unwrap();
                        let ((page_w, page_h), [scale, _, _, _, x, y]) = rendered_placement(&out.base64);
                        let (expect_w, expect_h) = cfg.page_size_pt();
                        assert!((page_w - expect_w).abs() < 0.01 && (page_h - expect_h).abs() < 0.01);

                        let margin = margins.points();
                        let assets = load_assets(&invoice, &client, &cfg);
                        let layout = build_ticket(&invoice, &client, &cfg, page_w - 2.0 * margin, &assets.aspects());
                        let placed = Placement {
                            x,
                            y,
                            width: layout.width * scale,
                            height: layout.height() * scale,
                            scale,
                        };
                        let (left, right, top, bottom) = placed.margins(page_w, page_h);
                        let label = format!("{} carts, {:?} {:?} {:?}", carts, paper, orientation, margins);
                        assert!((left - right).abs() < 1.0, "{}: left {} right {}", label, left, right);
                        assert!((top - bottom).abs() < 1.0, "{}: top {} bottom {}", label, top, bottom);
                        assert!(left >= margin - 0.5 && top >= margin - 0.5, "{}: content inside margins", label);
                    }
                }
            }
        }
    }

    #[test]
    fn oversized_content_is_scaled_not_cropped() {
        let p = fit_and_center((612.0, 792.0), (540.0, 1440.0), 36.0, 1.0);
        assert!((p.scale - 0.5).abs() < 1e-4);
        assert!((p.height - 720.0).abs() < 0.01);
        assert!((p.width - 270.0).abs() < 0.01);
        // Small content keeps its natural size.
        let small = fit_and_center((612.0, 792.0), (540.0, 200.0), 36.0, 1.0);
        assert_eq!(small.scale, 1.0);
    }

    #[test]
    fn paginate_never_splits_blocks() {
        let blocks: Vec<Block> = (0..10)
            .map(|_| Block {
                height: 30.0,
                elements: vec![],
            })
            .collect();
        let pages = paginate(&blocks, 100.0);
        assert_eq!(pages.len(), 4);
        assert!(pages.iter().all(|p| p.iter().map(|b| b.height).sum::<f32>() <= 100.0));
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 10);
    }

    #[test]
    fn renders_valid_single_page_pdf() {
        let invoice = sample_invoice(40);
        let client = sample_client();
        let out = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        let bytes = decode_pdf(&out.base64).unwrap();
        assert_eq!(bytes.len(), out.byte_len);
        assert_eq!(out.page_count, 1);
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn multi_page_mode_paginates_long_tickets() {
        let invoice = sample_invoice(40);
        let mut client = sample_client();
        client.print_config.pagination = Pagination::MultiPage;
        client.print_config.content_display = ContentDisplay::Detailed;
        let out = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        assert!(out.page_count > 1);
        let doc = Document::load_mem(&decode_pdf(&out.base64).unwrap()).unwrap();
        assert_eq!(doc.get_pages().len(), out.page_count);
    }

    #[test]
    fn broken_logo_is_omitted_not_fatal() {
        let invoice = sample_invoice(2);
        let mut client = sample_client();
        client.logo_base64 = Some("data:image/png;base64,bm90IGFuIGltYWdl".into());
        let out = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        assert_eq!(out.omitted_assets, vec!["logo".to_string()]);
        assert!(decode_pdf(&out.base64).is_ok());
    }

    #[test]
    fn decoded_assets_are_embedded() {
        let mut invoice = sample_invoice(2);
        invoice.signature.as_mut().unwrap().image_base64 = Some(png_base64(300, 100));
        let mut client = sample_client();
        client.logo_base64 = Some(png_base64(400, 200));
        client.print_config.show_watermark = true;
        client.print_config.show_border = true;
        let out = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        assert!(out.omitted_assets.is_empty());

        let doc = Document::load_mem(&decode_pdf(&out.base64).unwrap()).unwrap();
        let images = doc
            .objects
            .values()
            .filter(|o| match o {
                Object::Stream(s) => matches!(s.dict.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Image"),
                _ => false,
            })
            .count();
        assert_eq!(images, 2);
    }

    #[test]
    fn rendering_is_deterministic() {
        let invoice = sample_invoice(3);
        let client = sample_client();
        let a = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        let b = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        assert_eq!(a.base64, b.base64);
    }

    #[test]
    fn win_ansi_maps_latin1_and_replaces_the_rest() {
        assert_eq!(win_ansi("Bahía"), b"Bah\xeda".to_vec());
        assert_eq!(win_ansi("a→b"), b"a?b".to_vec());
    }

    #[tokio::test]
    async fn async_render_runs_on_blocking_pool() {
        let invoice = sample_invoice(1);
        let client = sample_client();
        let cfg = client.print_config.clone();
        let out = render_ticket_async(invoice, client, cfg, RasterOptions::default(), Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(out.page_count, 1);
    }
}
