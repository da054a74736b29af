use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ConfigurationError, StoreError};

use super::{DedupRecord, DedupStore, InsertOutcome};

/// Dedup store backed by a Postgres table with `event_uuid` as primary key.
///
/// `ON CONFLICT DO NOTHING` on the primary key gives us the atomic conditional
/// insert: exactly one concurrent insert for a given uuid affects a row. When no row
/// is affected the stored `claim_id` is read back to recognise our own earlier commit.
#[derive(Clone)]
pub struct PgDedupStore {
    pool: PgPool,
    table: String,
    insert_sql: String,
    claim_sql: String,
}

impl PgDedupStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, ConfigurationError> {
        validate_table_name(table)?;

        let insert_sql = format!(
            "INSERT INTO {table} (event_uuid, claim_id, first_seen_at) VALUES ($1, $2, $3) \
             ON CONFLICT (event_uuid) DO NOTHING"
        );
        let claim_sql = format!("SELECT claim_id FROM {table} WHERE event_uuid = $1");

        Ok(Self {
            pool,
            table: table.to_string(),
            insert_sql,
            claim_sql,
        })
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        table: &str,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        Self::new(pool, table).map_err(|e| sqlx::Error::Configuration(Box::new(e)))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the dedup table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                event_uuid TEXT PRIMARY KEY, \
                claim_id UUID NOT NULL, \
                first_seen_at TIMESTAMPTZ NOT NULL\
            )",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        info!(table = %self.table, "dedup table ready");
        Ok(())
    }

    /// Cheap round trip used at startup to fail fast on a bad table or credentials.
    pub async fn check_table(&self) -> Result<(), StoreError> {
        let probe = format!("SELECT 1 FROM {} LIMIT 1", self.table);
        sqlx::query(&probe).fetch_optional(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn insert_if_absent(&self, record: &DedupRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(&self.insert_sql)
            .bind(&record.event_uuid)
            .bind(record.claim_id)
            .bind(record.first_seen_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(InsertOutcome::Inserted);
        }

        let stored: Option<Uuid> = sqlx::query_scalar(&self.claim_sql)
            .bind(&record.event_uuid)
            .fetch_optional(&self.pool)
            .await?;

        match stored {
            Some(claim_id) if claim_id == record.claim_id => {
                warn!(
                    event_uuid = %record.event_uuid,
                    "dedup row already holds our claim, an earlier attempt committed"
                );
                Ok(InsertOutcome::Inserted)
            }
            Some(_) => Ok(InsertOutcome::AlreadyExists),
            // rows are never deleted by the pipeline, a missing row means external cleanup
            None => Err(StoreError::Unavailable(format!(
                "dedup row for {} vanished after a conflicting insert",
                record.event_uuid
            ))),
        }
    }
}

/// The table name is interpolated into SQL, so only plain identifiers are accepted:
/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_table_name(table: &str) -> Result<(), ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::Invalid {
        name: "DEDUP_TABLE",
        reason: format!("'{table}' {reason}"),
    };

    if table.is_empty() {
        return Err(ConfigurationError::Missing("DEDUP_TABLE"));
    }

    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return Err(invalid("has more than one schema qualifier"));
    }

    for part in parts {
        let mut chars = part.chars();
        let starts_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("is not a valid SQL identifier"));
        }
    }

    Ok(())
}
