//! Invoice and client storage.
//!
//! The send pipeline reads invoices and clients and writes back only the
//! `EmailStatus` sub-document. [`PgStore`] keeps each record as a JSONB
//! document in the application database; [`MemoryStore`] is used when no
//! database is configured and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::StoreError;
use crate::models::{Client, EmailStatus, Invoice};

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_invoice(&self, id: &str) -> Result<Invoice, StoreError>;

    async fn get_client(&self, id: &str) -> Result<Client, StoreError>;

    /// Replace the invoice's email status; no other field is touched.
    async fn update_email_status(&self, invoice_id: &str, status: &EmailStatus) -> Result<(), StoreError>;

    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn put_client(&self, client: &Client) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    invoices: RwLock<HashMap<String, Invoice>>,
    clients: RwLock<HashMap<String, Client>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn get_invoice(&self, id: &str) -> Result<Invoice, StoreError> {
        self.invoices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::InvoiceNotFound(id.to_string()))
    }

    async fn get_client(&self, id: &str) -> Result<Client, StoreError> {
        self.clients
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ClientNotFound(id.to_string()))
    }

    async fn update_email_status(&self, invoice_id: &str, status: &EmailStatus) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write().await;
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| StoreError::InvoiceNotFound(invoice_id.to_string()))?;
        invoice.email_status = status.clone();
        Ok(())
    }

    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.invoices
            .write()
            .await
            .insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn put_client(&self, client: &Client) -> Result<(), StoreError> {
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        Ok(())
    }
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run the bundled migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Connected to application database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        info!("Application migrations complete");

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn get_invoice(&self, id: &str) -> Result<Invoice, StoreError> {
        let row: Option<(Json<Invoice>, Option<Json<EmailStatus>>)> =
            sqlx::query_as("SELECT document, email_status FROM invoices WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let (Json(mut invoice), status) =
            row.ok_or_else(|| StoreError::InvoiceNotFound(id.to_string()))?;
        if let Some(Json(status)) = status {
            invoice.email_status = status;
        }
        Ok(invoice)
    }

    async fn get_client(&self, id: &str) -> Result<Client, StoreError> {
        let row: Option<(Json<Client>,)> = sqlx::query_as("SELECT document FROM clients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(Json(client),)| client)
            .ok_or_else(|| StoreError::ClientNotFound(id.to_string()))
    }

    async fn update_email_status(&self, invoice_id: &str, status: &EmailStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE invoices SET email_status = $1, updated_at = NOW() WHERE id = $2")
            .bind(Json(status))
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::InvoiceNotFound(invoice_id.to_string()));
        }
        Ok(())
    }

    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO invoices (id, client_id, document, email_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET client_id = EXCLUDED.client_id,
                document = EXCLUDED.document,
                email_status = EXCLUDED.email_status,
                updated_at = NOW()
            "#,
        )
        .bind(&invoice.id)
        .bind(&invoice.client_id)
        .bind(Json(invoice))
        .bind(Json(&invoice.email_status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_client(&self, client: &Client) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clients (id, name, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(&client.id)
        .bind(&client.name)
        .bind(Json(client))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
