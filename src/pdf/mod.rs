//! Delivery ticket PDFs.
//!
//! - `encoding`: base64 normalisation and `%PDF` validation
//! - `layout`: invoice + print settings → positioned text, rules and images
//! - `render`: layout → PDF pages (fit, centre, paginate, embed rasters)
//! - `compress`: the `none → high → maximum → ultra` size ladder

pub mod compress;
pub mod encoding;
pub mod layout;
pub mod render;
