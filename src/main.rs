//! # Invoice Mailer
//!
//! HTTP service that renders delivery tickets, compresses them to fit the
//! provider's attachment limits and emails them through SendGrid.
//!
//! ## Architecture
//!
//! - Axum handles HTTP routing and request/response lifecycle
//! - SQLx manages invoice/client documents when `APP_DATABASE_URL` is set;
//!   otherwise an in-memory store is used
//! - Rendering and compression run on the blocking pool with timeouts

use std::sync::Arc;

use tracing::{info, warn};

use invoice_mailer::config::AppConfig;
use invoice_mailer::db::{InvoiceStore, MemoryStore, PgStore};
use invoice_mailer::email::SendGridProvider;
use invoice_mailer::templates::ClientOverrides;
use invoice_mailer::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "invoice_mailer=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting invoice mailer");

    let config = AppConfig::from_env();
    info!("Email settings: {:?}", config.email);
    if config.email.sendgrid_api_key.is_none() {
        warn!("SENDGRID_API_KEY is not set; sends will fail until it is configured");
    }

    let store: Arc<dyn InvoiceStore> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            warn!("APP_DATABASE_URL is not set; using in-memory invoice store");
            Arc::new(MemoryStore::new())
        }
    };

    let overrides = ClientOverrides::load(config.client_overrides_path.as_deref());
    info!("{} client override(s) active", overrides.len());

    let provider = Arc::new(SendGridProvider::new(config.email.clone())?);
    let bind_addr = config.bind_addr.clone();
    let app = create_app(AppState::new(config, store, provider, overrides));

    // Bind and serve
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
