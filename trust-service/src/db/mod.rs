//! Record persistence: the storage contract used by the secured store,
//! a PostgreSQL backend and an in-memory backend.

pub mod memory;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;

/// Encrypted secret fields of one record, by field name.
pub type SecretColumns = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{kind} {id} already exists")]
    Conflict { kind: String, id: String },

    #[error("record store error: {0}")]
    Backend(anyhow::Error),
}

impl StoreError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        StoreError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(anyhow::Error::new(err)),
            other => StoreError::Backend(anyhow::Error::new(other)),
        }
    }
}

/// A persisted record with its detached signature. Secret fields live
/// beside the row and never appear in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub kind: String,
    pub id: String,
    pub data: serde_json::Value,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Top-level string field equals the value.
    Eq(String, String),
    /// Top-level string field is one of the values.
    In(String, Vec<String>),
    /// Top-level RFC 3339 timestamp field is strictly before the instant.
    Before(String, DateTime<Utc>),
}

impl Predicate {
    fn matches(&self, row: &StoredRow) -> bool {
        match self {
            Predicate::Eq(field, value) => field_str(row, field) == Some(value.as_str()),
            Predicate::In(field, values) => field_str(row, field)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            Predicate::Before(field, instant) => field_str(row, field)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|ts| ts.with_timezone(&Utc) < *instant)
                .unwrap_or(false),
        }
    }
}

fn field_str<'a>(row: &'a StoredRow, field: &str) -> Option<&'a str> {
    if field == "id" {
        return Some(&row.id);
    }
    row.data.get(field).and_then(|v| v.as_str())
}

/// Selection over one record kind; predicates are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: &'static str,
    pub predicates: Vec<Predicate>,
}

impl Query {
    pub fn all(kind: &'static str) -> Self {
        Self {
            kind,
            predicates: Vec::new(),
        }
    }

    pub fn by_id(kind: &'static str, id: &str) -> Self {
        Self::all(kind).eq("id", id)
    }

    pub fn eq(mut self, field: &str, value: &str) -> Self {
        self.predicates
            .push(Predicate::Eq(field.to_string(), value.to_string()));
        self
    }

    pub fn any_of(mut self, field: &str, values: &[String]) -> Self {
        self.predicates
            .push(Predicate::In(field.to_string(), values.to_vec()));
        self
    }

    pub fn before(mut self, field: &str, instant: DateTime<Utc>) -> Self {
        self.predicates
            .push(Predicate::Before(field.to_string(), instant));
        self
    }

    pub fn matches(&self, row: &StoredRow) -> bool {
        row.kind == self.kind && self.predicates.iter().all(|p| p.matches(row))
    }
}

/// Storage contract behind the secured store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select_one(&self, query: &Query) -> Result<Option<StoredRow>, StoreError>;

    /// Matching rows in insertion order.
    async fn select_all(&self, query: &Query) -> Result<Vec<StoredRow>, StoreError>;

    async fn select_secrets(
        &self,
        kind: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SecretColumns>, StoreError>;

    /// Returns whether a row was deleted.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Writes are visible to others only after `commit`. Dropping the
/// transaction rolls it back and releases its row locks.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Reads a row and locks it until the transaction ends.
    async fn select_for_update(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredRow>, StoreError>;

    async fn select_secrets(&mut self, kind: &str, id: &str) -> Result<SecretColumns, StoreError>;

    async fn insert(&mut self, row: &StoredRow) -> Result<(), StoreError>;

    async fn update(&mut self, row: &StoredRow) -> Result<(), StoreError>;

    /// Replaces the named secret columns, leaving the others untouched.
    async fn update_secrets(
        &mut self,
        kind: &str,
        id: &str,
        secrets: &SecretColumns,
    ) -> Result<(), StoreError>;

    async fn delete(&mut self, kind: &str, id: &str) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> StoredRow {
        StoredRow {
            kind: "auth_session".into(),
            id: "s1".into(),
            data: json!({
                "id": "s1",
                "consumer_id": "c1",
                "expire_at": "2024-01-01T00:00:00Z",
            }),
            signature: String::new(),
        }
    }

    #[test]
    fn test_query_matches_fields() {
        let cutoff = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert!(Query::by_id("auth_session", "s1").matches(&row()));
        assert!(Query::all("auth_session").eq("consumer_id", "c1").matches(&row()));
        assert!(!Query::all("auth_consumer").matches(&row()));
        assert!(Query::all("auth_session")
            .any_of("consumer_id", &["c0".to_string(), "c1".to_string()])
            .matches(&row()));
        assert!(Query::all("auth_session")
            .before("expire_at", cutoff)
            .matches(&row()));
        assert!(!Query::all("auth_session")
            .before("missing", cutoff)
            .matches(&row()));
    }

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }
}
