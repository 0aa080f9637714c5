//! Adaptive PDF compression.
//!
//! Walks the ladder `none → high → maximum → ultra`, stopping at the first
//! level whose output fits the ceiling. Every level starts again from the
//! original document and re-rasterises its embedded images at a lower
//! resolution and JPEG quality; bytes are never truncated. The smallest valid
//! output seen so far is carried forward, so a later level can never return
//! something larger than an earlier one.
//!
//! Sizes are measured on the base64 encoding, which is what the email
//! provider counts against its limits.

use image::imageops::FilterType;
use std::collections::HashSet;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PdfError;
use crate::pdf::encoding::{decode_pdf, encode_base64, encoded_len, is_pdf, normalize_base64};
use crate::pdf::render::{encode_jpeg, flatten_to_rgb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    None,
    High,
    Maximum,
    Ultra,
}

impl CompressionLevel {
    pub const LADDER: [CompressionLevel; 4] = [
        CompressionLevel::None,
        CompressionLevel::High,
        CompressionLevel::Maximum,
        CompressionLevel::Ultra,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionLevel::None => "none",
            CompressionLevel::High => "high",
            CompressionLevel::Maximum => "maximum",
            CompressionLevel::Ultra => "ultra",
        }
    }

    pub fn next(&self) -> Option<CompressionLevel> {
        match self {
            CompressionLevel::None => Some(CompressionLevel::High),
            CompressionLevel::High => Some(CompressionLevel::Maximum),
            CompressionLevel::Maximum => Some(CompressionLevel::Ultra),
            CompressionLevel::Ultra => None,
        }
    }

    /// Image resolution factor and JPEG quality for this level.
    fn raster(&self) -> Option<(f32, u8)> {
        match self {
            CompressionLevel::None => None,
            CompressionLevel::High => Some((1.0, 85)),
            CompressionLevel::Maximum => Some((0.5, 55)),
            CompressionLevel::Ultra => Some((0.3, 40)),
        }
    }
}

/// Outcome of a compression run.
///
/// `success` is false when even the last level tried could not reach the
/// ceiling; `pdf_base64` still holds the smallest valid document produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub success: bool,
    pub original_size_bytes: usize,
    pub compressed_size_bytes: usize,
    pub compression_level_used: CompressionLevel,
    #[serde(skip)]
    pub pdf_base64: String,
}

// ============================================================================
// Image re-rasterisation
// ============================================================================

fn name_of(obj: &Object) -> Option<&[u8]> {
    match obj {
        Object::Name(n) => Some(n.as_slice()),
        Object::Array(items) if items.len() == 1 => name_of(&items[0]),
        _ => None,
    }
}

fn is_image(stream: &Stream) -> bool {
    matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Image")
}

/// Ids of image streams that another image points at through `/SMask` or
/// `/Mask`. These hold alpha, not colour, and must stay `DeviceGray`.
fn mask_ids(doc: &Document) -> HashSet<ObjectId> {
    doc.objects
        .values()
        .filter_map(|object| match object {
            Object::Stream(stream) if is_image(stream) => Some(&stream.dict),
            _ => None,
        })
        .flat_map(|dict| {
            [&b"SMask"[..], &b"Mask"[..]]
                .into_iter()
                .filter_map(move |key| dict.get(key).ok()?.as_reference().ok())
        })
        .collect()
}

/// Decode an image XObject we know how to handle; `None` for anything else
/// (stencil masks, colour-key masks, indexed or ICC colour, exotic filters).
fn decode_image_stream(stream: &Stream) -> Option<DynamicImage> {
    let dict = &stream.dict;
    if matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
        return None;
    }
    // Colour-key masking needs exact sample values; JPEG would break it.
    if matches!(dict.get(b"Mask"), Ok(Object::Array(_))) {
        return None;
    }
    let width = u32::try_from(dict.get(b"Width").ok()?.as_i64().ok()?).ok()?;
    let height = u32::try_from(dict.get(b"Height").ok()?.as_i64().ok()?).ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    let filter = dict.get(b"Filter").ok().and_then(name_of);

    match filter {
        Some(b"DCTDecode") => {
            image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg).ok()
        }
        None | Some(b"FlateDecode") => {
            let bpc = dict
                .get(b"BitsPerComponent")
                .ok()
                .and_then(|o| o.as_i64().ok())
                .unwrap_or(8);
            if bpc != 8 {
                return None;
            }
            let raw = match filter {
                Some(_) => stream.decompressed_content().ok()?,
                None => stream.content.clone(),
            };
            let pixels = (width as usize).checked_mul(height as usize)?;
            match dict.get(b"ColorSpace").ok().and_then(name_of) {
                Some(b"DeviceRGB") => {
                    let len = pixels.checked_mul(3)?;
                    if raw.len() < len {
                        return None;
                    }
                    RgbImage::from_raw(width, height, raw[..len].to_vec()).map(DynamicImage::ImageRgb8)
                }
                Some(b"DeviceGray") if raw.len() >= pixels => {
                    GrayImage::from_raw(width, height, raw[..pixels].to_vec())
                        .map(DynamicImage::ImageLuma8)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn encode_gray_jpeg(img: &GrayImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(img)?;
    Ok(buf)
}

/// Replace an image stream with a smaller JPEG. Returns whether it changed.
///
/// Soft masks are re-encoded as single-channel `DeviceGray` at the same
/// scale as the colour image they belong to.
fn downsample_image(stream: &mut Stream, scale: f32, quality: u8, is_mask: bool) -> bool {
    let Some(img) = decode_image_stream(stream) else {
        return false;
    };
    let w = ((img.width() as f32 * scale).round() as u32).max(1);
    let h = ((img.height() as f32 * scale).round() as u32).max(1);
    let resized = if w == img.width() && h == img.height() {
        img
    } else {
        img.resize_exact(w, h, FilterType::Triangle)
    };
    let encoded = if is_mask {
        encode_gray_jpeg(&resized.to_luma8(), quality)
    } else {
        encode_jpeg(&flatten_to_rgb(&resized), quality)
    };
    let jpeg = match encoded {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Skipping image re-encode: {}", e);
            return false;
        }
    };
    if jpeg.len() >= stream.content.len() {
        return false;
    }

    let dict = &mut stream.dict;
    dict.set("Width", w as i64);
    dict.set("Height", h as i64);
    dict.set("ColorSpace", if is_mask { "DeviceGray" } else { "DeviceRGB" });
    dict.set("BitsPerComponent", 8);
    dict.set("Filter", "DCTDecode");
    dict.remove(b"DecodeParms");
    dict.remove(b"Decode");
    stream.set_content(jpeg);
    stream.allows_compression = false;
    true
}

/// Produce the document for one level from the original bytes.
fn recompress(original: &[u8], level: CompressionLevel) -> Result<Vec<u8>, PdfError> {
    let Some((scale, quality)) = level.raster() else {
        return Ok(original.to_vec());
    };
    let mut doc = Document::load_mem(original).map_err(|e| PdfError::Parse(e.to_string()))?;

    let masks = mask_ids(&doc);
    let mut touched = 0usize;
    for (id, object) in doc.objects.iter_mut() {
        if let Object::Stream(stream) = object {
            if is_image(stream) && downsample_image(stream, scale, quality, masks.contains(id)) {
                touched += 1;
            }
        }
    }
    doc.compress();

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| PdfError::Write(e.to_string()))?;
    debug!(
        "Level {}: re-encoded {} image(s), {} -> {} bytes",
        level.as_str(),
        touched,
        original.len(),
        out.len()
    );
    Ok(out)
}

// ============================================================================
// Ladder
// ============================================================================

struct Ladder {
    original: Vec<u8>,
    original_b64: String,
    best: Option<(Vec<u8>, CompressionLevel)>,
}

impl Ladder {
    fn new(input: &str) -> Result<Self, PdfError> {
        let original_b64 = normalize_base64(input)?;
        let original = decode_pdf(&original_b64)?;
        Ok(Self {
            original,
            original_b64,
            best: None,
        })
    }

    fn best_size(&self) -> usize {
        match &self.best {
            Some((bytes, _)) => encoded_len(bytes.len()),
            None => self.original_b64.len(),
        }
    }

    /// Try one level, keeping its output only if it is valid and smaller.
    fn step(&mut self, level: CompressionLevel) {
        if level == CompressionLevel::None {
            return;
        }
        match recompress(&self.original, level) {
            Ok(bytes) if !is_pdf(&bytes) => {
                warn!(
                    "Level {} produced output without a PDF signature; keeping previous artifact",
                    level.as_str()
                );
            }
            Ok(bytes) => {
                if encoded_len(bytes.len()) < self.best_size() {
                    self.best = Some((bytes, level));
                }
            }
            Err(e) => warn!("Level {} failed: {}", level.as_str(), e),
        }
    }

    fn finish(self, ceiling: Option<usize>) -> CompressionResult {
        let original_size_bytes = self.original_b64.len();
        let (pdf_base64, level) = match self.best {
            Some((bytes, level)) => (encode_base64(&bytes), level),
            None => (self.original_b64, CompressionLevel::None),
        };
        let compressed_size_bytes = pdf_base64.len();
        CompressionResult {
            success: ceiling.map_or(true, |c| compressed_size_bytes <= c),
            original_size_bytes,
            compressed_size_bytes,
            compression_level_used: level,
            pdf_base64,
        }
    }
}

/// Compress `input` until its encoded size is at most `ceiling`.
///
/// Inputs already under the ceiling come back unchanged with level `none`.
pub fn compress_pdf(input: &str, ceiling: usize) -> Result<CompressionResult, PdfError> {
    compress_pdf_from(input, ceiling, CompressionLevel::None)
}

/// Like [`compress_pdf`] but never uses a level below `start`.
///
/// The dispatcher uses this to escalate after a provider size rejection.
pub fn compress_pdf_from(
    input: &str,
    ceiling: usize,
    start: CompressionLevel,
) -> Result<CompressionResult, PdfError> {
    let mut ladder = Ladder::new(input)?;
    let original = ladder.original_b64.len();

    if start == CompressionLevel::None && original <= ceiling {
        debug!("PDF already fits ({} <= {} bytes), skipping compression", original, ceiling);
        return Ok(ladder.finish(Some(ceiling)));
    }

    for level in CompressionLevel::LADDER.into_iter().filter(|l| *l >= start) {
        ladder.step(level);
        if ladder.best.is_some() && ladder.best_size() <= ceiling {
            break;
        }
    }

    let result = ladder.finish(Some(ceiling));
    if result.success {
        info!(
            "Compressed PDF {} -> {} bytes using level {}",
            result.original_size_bytes,
            result.compressed_size_bytes,
            result.compression_level_used.as_str()
        );
    } else {
        warn!(
            "Could not compress PDF under {} bytes: best {} bytes at level {}",
            ceiling,
            result.compressed_size_bytes,
            result.compression_level_used.as_str()
        );
    }
    Ok(result)
}

/// Run the ladder up to and including `level` with no ceiling.
pub fn compress_to_level(input: &str, level: CompressionLevel) -> Result<CompressionResult, PdfError> {
    let mut ladder = Ladder::new(input)?;
    for l in CompressionLevel::LADDER.into_iter().filter(|l| *l <= level) {
        ladder.step(l);
    }
    Ok(ladder.finish(None))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pdf::encoding::decode_base64;
    use crate::pdf::render::tests::{png_base64, sample_client, sample_invoice};
    use crate::pdf::render::{render_ticket, RasterOptions};
    use lopdf::dictionary;
    use lopdf::content::{Content, Operation};

    /// Deterministic noise so JPEG cannot shrink it much at high quality.
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                (seed >> 24) as u8
            })
            .collect()
    }

    fn raw_image(side: u32, colour_space: &str, channels: u32, seed: u64) -> Stream {
        let mut image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => side as i64,
                "Height" => side as i64,
                "ColorSpace" => colour_space,
                "BitsPerComponent" => 8,
            },
            noise((side * side * channels) as usize, seed),
        );
        image.allows_compression = false;
        image
    }

    /// Wrap the image XObject `add_image` creates in a one-page document.
    fn one_image_pdf(add_image: impl FnOnce(&mut Document) -> ObjectId) -> String {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image_id = add_image(&mut doc);
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new("cm", vec![540.into(), 0.into(), 0.into(), 540.into(), 36.into(), 126.into()]),
                Operation::new("Do", vec!["Im0".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        encode_base64(&bytes)
    }

    /// A one-page PDF holding an uncompressed RGB noise image, as canvas
    /// exports tend to produce.
    pub(crate) fn raw_image_pdf(side: u32) -> String {
        one_image_pdf(|doc| doc.add_object(raw_image(side, "DeviceRGB", 3, 0x9E37_79B9_7F4A_7C15)))
    }

    fn load(pdf_base64: &str) -> Document {
        Document::load_mem(&decode_base64(pdf_base64).unwrap()).unwrap()
    }

    fn image_dicts(doc: &Document) -> Vec<(ObjectId, &lopdf::Dictionary)> {
        doc.objects
            .iter()
            .filter_map(|(id, o)| match o {
                Object::Stream(s) if is_image(s) => Some((*id, &s.dict)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn under_ceiling_is_returned_unchanged() {
        let pdf = raw_image_pdf(700);
        assert!(pdf.len() > 1_900_000 && pdf.len() < 2_100_000, "got {}", pdf.len());

        let result = compress_pdf(&pdf, 5_000_000).unwrap();
        assert!(result.success);
        assert_eq!(result.compression_level_used, CompressionLevel::None);
        assert_eq!(result.pdf_base64, pdf);
        assert_eq!(result.compressed_size_bytes, result.original_size_bytes);
    }

    #[test]
    fn data_uri_input_under_ceiling_decodes_to_same_bytes() {
        let pdf = raw_image_pdf(64);
        let wrapped = format!("data:application/pdf;base64,{}", pdf);
        let result = compress_pdf(&wrapped, 5_000_000).unwrap();
        assert_eq!(decode_base64(&result.pdf_base64).unwrap(), decode_base64(&pdf).unwrap());
    }

    #[test]
    fn oversized_pdf_reaches_ceiling_with_aggressive_level() {
        let pdf = raw_image_pdf(1800);
        assert!(pdf.len() > 12_500_000, "got {}", pdf.len());

        let result = compress_pdf(&pdf, 3_000_000).unwrap();
        assert!(result.success);
        assert!(result.compressed_size_bytes <= 3_000_000);
        assert!(
            matches!(
                result.compression_level_used,
                CompressionLevel::Maximum | CompressionLevel::Ultra
            ),
            "used {:?}",
            result.compression_level_used
        );
        let bytes = decode_base64(&result.pdf_base64).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
        assert!(Document::load_mem(&bytes).is_ok());
    }

    #[test]
    fn levels_are_monotonic_and_valid() {
        let pdf = raw_image_pdf(400);
        let mut previous = pdf.len();
        for level in CompressionLevel::LADDER {
            let result = compress_to_level(&pdf, level).unwrap();
            assert!(
                result.compressed_size_bytes <= previous,
                "{:?}: {} > {}",
                level,
                result.compressed_size_bytes,
                previous
            );
            assert!(decode_base64(&result.pdf_base64).unwrap().starts_with(b"%PDF"));
            previous = result.compressed_size_bytes;
        }
    }

    #[test]
    fn unreachable_ceiling_returns_best_effort() {
        let pdf = raw_image_pdf(200);
        let result = compress_pdf(&pdf, 100).unwrap();
        assert!(!result.success);
        assert!(result.compressed_size_bytes < result.original_size_bytes);
        assert!(decode_base64(&result.pdf_base64).unwrap().starts_with(b"%PDF"));
    }

    #[test]
    fn pdf_without_images_cannot_shrink_but_stays_valid() {
        let invoice = sample_invoice(2);
        let client = sample_client();
        let rendered = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        let result = compress_pdf(&rendered.base64, 10).unwrap();
        assert!(!result.success);
        assert!(result.compressed_size_bytes <= result.original_size_bytes);
        assert!(decode_base64(&result.pdf_base64).unwrap().starts_with(b"%PDF"));
    }

    #[test]
    fn rendered_ticket_with_assets_shrinks() {
        let mut invoice = sample_invoice(2);
        invoice.signature.as_mut().unwrap().image_base64 = Some(png_base64(900, 300));
        let mut client = sample_client();
        client.logo_base64 = Some(png_base64(1200, 600));
        let rendered = render_ticket(&invoice, &client, &client.print_config, RasterOptions::default()).unwrap();
        let ultra = compress_to_level(&rendered.base64, CompressionLevel::Ultra).unwrap();
        assert!(ultra.compressed_size_bytes < ultra.original_size_bytes);
    }

    #[test]
    fn start_level_skips_lower_levels() {
        let pdf = raw_image_pdf(300);
        let result = compress_pdf_from(&pdf, usize::MAX, CompressionLevel::Maximum).unwrap();
        assert!(result.compression_level_used >= CompressionLevel::Maximum);
    }

    #[test]
    fn soft_mask_stays_gray() {
        let pdf = one_image_pdf(|doc| {
            let mask_id = doc.add_object(raw_image(200, "DeviceGray", 1, 0x51ED_2701_A5A5_0F0F));
            let mut image = raw_image(200, "DeviceRGB", 3, 0x9E37_79B9_7F4A_7C15);
            image.dict.set("SMask", mask_id);
            doc.add_object(image)
        });

        let result = compress_to_level(&pdf, CompressionLevel::Maximum).unwrap();
        assert_eq!(result.compression_level_used, CompressionLevel::Maximum);

        let doc = load(&result.pdf_base64);
        let images = image_dicts(&doc);
        assert_eq!(images.len(), 2);
        let (_, colour) = images
            .iter()
            .find(|(_, d)| d.has(b"SMask"))
            .expect("colour image keeps its soft mask");
        let mask_id = colour.get(b"SMask").unwrap().as_reference().unwrap();
        let (_, mask) = images.iter().find(|(id, _)| *id == mask_id).unwrap();

        assert_eq!(name_of(colour.get(b"ColorSpace").unwrap()), Some(&b"DeviceRGB"[..]));
        assert_eq!(name_of(mask.get(b"ColorSpace").unwrap()), Some(&b"DeviceGray"[..]));
        // Both halves are scaled together so the mask still covers the image.
        assert_eq!(colour.get(b"Width").unwrap().as_i64().unwrap(), 100);
        assert_eq!(mask.get(b"Width").unwrap().as_i64().unwrap(), 100);
    }

    #[test]
    fn image_with_bogus_dimensions_is_left_alone() {
        let pdf = one_image_pdf(|doc| {
            let mut image = raw_image(64, "DeviceRGB", 3, 7);
            image.dict.set("Width", -1);
            doc.add_object(image)
        });
        let result = compress_to_level(&pdf, CompressionLevel::Ultra).unwrap();

        let doc = load(&result.pdf_base64);
        let (_, image) = image_dicts(&doc)[0];
        assert_eq!(image.get(b"Width").unwrap().as_i64().unwrap(), -1);
        assert_eq!(image.get(b"Height").unwrap().as_i64().unwrap(), 64);
        assert_ne!(image.get(b"Filter").ok().and_then(name_of), Some(&b"DCTDecode"[..]));
    }

    #[test]
    fn non_pdf_input_is_an_error() {
        let not_pdf = encode_base64(b"<html>nope</html>");
        assert!(matches!(compress_pdf(&not_pdf, 10), Err(PdfError::NotAPdf { .. })));
    }

    #[test]
    fn ladder_order() {
        assert_eq!(CompressionLevel::None.next(), Some(CompressionLevel::High));
        assert_eq!(CompressionLevel::Ultra.next(), None);
        assert!(CompressionLevel::High < CompressionLevel::Ultra);
        assert_eq!(serde_json::to_string(&CompressionLevel::Maximum).unwrap(), "\"maximum\"");
    }
}
