//! Base64 normalisation for PDF payloads coming from browsers.
//!
//! Clients post the ticket as a bare base64 string, as a data URI
//! (`data:application/pdf;base64,...`), or with line breaks and stray
//! characters picked up on the way. Everything is reduced to canonical padded
//! standard base64 before decoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::PdfError;

/// PDF file signature.
pub const PDF_MAGIC: &[u8] = b"%PDF";

/// Strip any data-URI prefix and non-alphabet characters, then restore padding.
///
/// URL-safe characters (`-`, `_`) are mapped onto the standard alphabet.
pub fn normalize_base64(input: &str) -> Result<String, PdfError> {
    let payload = match input.find("base64,") {
        Some(idx) => &input[idx + "base64,".len()..],
        None => input,
    };

    let mut cleaned: String = payload
        .chars()
        .filter_map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '+' | '/' => Some(c),
            '-' => Some('+'),
            '_' => Some('/'),
            _ => None,
        })
        .collect();

    if cleaned.is_empty() {
        return Err(PdfError::Empty);
    }

    match cleaned.len() % 4 {
        0 => {}
        1 => {
            return Err(PdfError::InvalidBase64(format!(
                "{} significant characters cannot form whole bytes",
                cleaned.len()
            )))
        }
        rem => cleaned.push_str(&"=".repeat(4 - rem)),
    }
    Ok(cleaned)
}

/// Normalise and decode a base64 payload.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, PdfError> {
    let normalized = normalize_base64(input)?;
    STANDARD
        .decode(normalized.as_bytes())
        .map_err(|e| PdfError::InvalidBase64(e.to_string()))
}

/// Normalise, decode and check the `%PDF` signature.
pub fn decode_pdf(input: &str) -> Result<Vec<u8>, PdfError> {
    let bytes = decode_base64(input)?;
    if !is_pdf(&bytes) {
        return Err(PdfError::NotAPdf {
            magic: bytes.iter().take(4).copied().collect(),
        });
    }
    Ok(bytes)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Length of the padded base64 encoding of `n` bytes.
pub fn encoded_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"%PDF-1.5 sample";

    #[test]
    fn bare_base64_decodes() {
        let b64 = encode_base64(SAMPLE);
        assert_eq!(decode_pdf(&b64).unwrap(), SAMPLE);
    }

    #[test]
    fn data_uri_prefix_is_stripped() {
        let b64 = format!("data:application/pdf;base64,{}", encode_base64(SAMPLE));
        assert_eq!(decode_pdf(&b64).unwrap(), SAMPLE);
    }

    #[test]
    fn whitespace_and_missing_padding_are_repaired() {
        let b64 = encode_base64(SAMPLE);
        let trimmed = b64.trim_end_matches('=');
        let mut dirty = String::new();
        for (i, c) in trimmed.chars().enumerate() {
            dirty.push(c);
            if i % 7 == 0 {
                dirty.push_str("\r\n ");
            }
        }
        assert_eq!(decode_pdf(&dirty).unwrap(), SAMPLE);
    }

    #[test]
    fn non_pdf_payload_is_rejected() {
        let b64 = encode_base64(b"GIF89a....");
        assert!(matches!(decode_pdf(&b64), Err(PdfError::NotAPdf { .. })));
    }

    #[test]
    fn empty_and_garbage_inputs_error() {
        assert!(matches!(normalize_base64("  \n"), Err(PdfError::Empty)));
        assert!(matches!(normalize_base64("data:application/pdf;base64,"), Err(PdfError::Empty)));
        assert!(matches!(normalize_base64("abcde"), Err(PdfError::InvalidBase64(_))));
    }

    #[test]
    fn encoded_len_matches_engine() {
        for n in [0usize, 1, 2, 3, 4, 100, 1001] {
            assert_eq!(encoded_len(n), encode_base64(&vec![0u8; n]).len());
        }
    }
}
