//! Admin action audit trail.
//!
//! Entries are written after a successful mutating call. Writing is best
//! effort: a failed audit write is logged and never fails the request.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub admin_id: String,
    pub action: String,
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(admin_id: &str, action: &str, entity_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            admin_id: admin_id.to_string(),
            action: action.to_string(),
            entity_id: entity_id.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<()>;
}

// ------------------------------------------------------------------ //
//  PostgreSQL                                                         //
// ------------------------------------------------------------------ //

pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    /// Create the `admin_logs` table if it doesn't exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS admin_logs (
                id          UUID PRIMARY KEY,
                admin_id    TEXT NOT NULL,
                action      TEXT NOT NULL,
                entity_id   TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create admin_logs table")?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_logs (id, admin_id, action, entity_id, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.admin_id)
        .bind(&entry.action)
        .bind(&entry.entity_id)
        .bind(entry.occurred_at)
        .execute(&self.pool)
        .await
        .context("INSERT into admin_logs failed")?;
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Log-only and in-memory                                             //
// ------------------------------------------------------------------ //

/// Used when no database is configured.
pub struct LogAuditLog;

#[async_trait]
impl AuditLog for LogAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        info!(
            audit_id = %entry.id,
            admin_id = entry.admin_id,
            action = entry.action,
            entity_id = entry.entity_id,
            "admin action"
        );
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryAuditLog {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}
