//! Outbound email: the provider boundary and the size-aware dispatcher.
//!
//! - `provider`: one HTTP call per message to the transactional email API
//! - `dispatch`: retry/fallback policy around the provider (recompress on a
//!   size rejection, then send without the attachment)

pub mod dispatch;
pub mod provider;

pub use dispatch::{DispatchReport, DispatchRequest, Dispatcher, PdfAttachment};
pub use provider::{Attachment, EmailMessage, EmailProvider, SendGridProvider};
