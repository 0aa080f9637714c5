//! HTTP route modules.
//!
//! - `email`: relay endpoints that send a caller-supplied PDF
//! - `invoices`: send/status/preview for stored invoices, plus `/health`

pub mod email;
pub mod invoices;
