use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{DocumentStore, StoredDocument};
use crate::models::StoreError;

/// PostgreSQL-backed document store.
///
/// Schema expectations:
/// - `documents(id uuid pk, title text, version bigint, state bytea,
///    updated_at timestamptz, updated_by text, deleted boolean)`
/// - `document_ops(id bigserial pk, document uuid, version bigint,
///    state bytea, created_at timestamptz, created_by text)`
/// - `document_snapshots(id bigserial pk, document uuid, version bigint,
///    state bytea, created_at timestamptz)`
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn load_document(&self, document_id: Uuid) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT title, version, state
            FROM documents
            WHERE id = $1 AND deleted = FALSE
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredDocument {
            title: r.get("title"),
            version: r.get("version"),
            state: r.get::<Option<Vec<u8>>, _>("state").unwrap_or_default(),
        }))
    }

    async fn save_state(
        &self,
        document_id: Uuid,
        state: &[u8],
        saved_by: &str,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO documents (id, title, version, state, updated_at, updated_by, deleted)
            VALUES ($1, 'Untitled', 1, $2, NOW(), $3, FALSE)
            ON CONFLICT (id) DO UPDATE
            SET state = EXCLUDED.state,
                version = documents.version + 1,
                updated_at = NOW(),
                updated_by = EXCLUDED.updated_by
            RETURNING version
            "#,
        )
        .bind(document_id)
        .bind(state)
        .bind(saved_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("version"))
    }

    async fn append_operation_record(
        &self,
        document_id: Uuid,
        state: &[u8],
        version: i64,
        saved_by: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO document_ops (document, version, state, created_at, created_by)
            VALUES ($1, $2, $3, NOW(), $4)
            "#,
        )
        .bind(document_id)
        .bind(version)
        .bind(state)
        .bind(saved_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_snapshot_record(
        &self,
        document_id: Uuid,
        state: &[u8],
        version: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO document_snapshots (document, version, state, created_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(document_id)
        .bind(version)
        .bind(state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
