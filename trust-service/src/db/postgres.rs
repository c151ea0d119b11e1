use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;

use super::{Predicate, Query, RecordStore, SecretColumns, StoreError, StoreTransaction, StoredRow};

/// Records of every kind share one table keyed by `(kind, id)`.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    kind: String,
    id: String,
    data: serde_json::Value,
    signature: String,
}

impl From<RecordRow> for StoredRow {
    fn from(row: RecordRow) -> Self {
        StoredRow {
            kind: row.kind,
            id: row.id,
            data: row.data,
            signature: row.signature,
        }
    }
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn select_builder(query: &Query) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT kind, id, data, signature FROM secured_records WHERE kind = ");
    qb.push_bind(query.kind.to_string());

    for predicate in &query.predicates {
        match predicate {
            Predicate::Eq(field, value) if field == "id" => {
                qb.push(" AND id = ").push_bind(value.clone());
            }
            Predicate::Eq(field, value) => {
                qb.push(" AND data->>")
                    .push_bind(field.clone())
                    .push(" = ")
                    .push_bind(value.clone());
            }
            Predicate::In(field, values) if field == "id" => {
                qb.push(" AND id = ANY(").push_bind(values.clone()).push(")");
            }
            Predicate::In(field, values) => {
                qb.push(" AND data->>")
                    .push_bind(field.clone())
                    .push(" = ANY(")
                    .push_bind(values.clone())
                    .push(")");
            }
            Predicate::Before(field, instant) => {
                qb.push(" AND (data->>")
                    .push_bind(field.clone())
                    .push(")::timestamptz < ")
                    .push_bind(*instant);
            }
        }
    }

    qb.push(" ORDER BY seq");
    qb
}

fn encode_secrets(secrets: &SecretColumns) -> serde_json::Value {
    secrets
        .iter()
        .map(|(name, bytes)| (name.clone(), serde_json::Value::String(STANDARD.encode(bytes))))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn decode_secrets(value: serde_json::Value) -> Result<SecretColumns, StoreError> {
    let serde_json::Value::Object(map) = value else {
        return Ok(SecretColumns::new());
    };
    map.into_iter()
        .filter_map(|(name, v)| v.as_str().map(|s| (name, s.to_string())))
        .map(|(name, encoded)| {
            STANDARD
                .decode(encoded)
                .map(|bytes| (name, bytes))
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("corrupted secret column: {}", e)))
        })
        .collect()
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn select_one(&self, query: &Query) -> Result<Option<StoredRow>, StoreError> {
        let mut qb = select_builder(query);
        qb.push(" LIMIT 1");
        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(StoredRow::from))
    }

    async fn select_all(&self, query: &Query) -> Result<Vec<StoredRow>, StoreError> {
        let rows = select_builder(query)
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(StoredRow::from).collect())
    }

    async fn select_secrets(
        &self,
        kind: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SecretColumns>, StoreError> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT id, secrets FROM secured_records WHERE kind = $1 AND id = ANY($2)",
        )
        .bind(kind)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, secrets)| decode_secrets(secrets).map(|s| (id, s)))
            .collect()
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM secured_records WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn select_for_update(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredRow>, StoreError> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT kind, id, data, signature FROM secured_records WHERE kind = $1 AND id = $2 FOR UPDATE",
        )
        .bind(kind)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(StoredRow::from))
    }

    async fn select_secrets(&mut self, kind: &str, id: &str) -> Result<SecretColumns, StoreError> {
        let secrets: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT secrets FROM secured_records WHERE kind = $1 AND id = $2",
        )
        .bind(kind)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        match secrets {
            Some(value) => decode_secrets(value),
            None => Ok(SecretColumns::new()),
        }
    }

    async fn insert(&mut self, row: &StoredRow) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO secured_records (kind, id, data, signature) VALUES ($1, $2, $3, $4)",
        )
        .bind(&row.kind)
        .bind(&row.id)
        .bind(&row.data)
        .bind(&row.signature)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict {
                kind: row.kind.clone(),
                id: row.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&mut self, row: &StoredRow) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE secured_records SET data = $3, signature = $4, updated_utc = now() WHERE kind = $1 AND id = $2",
        )
        .bind(&row.kind)
        .bind(&row.id)
        .bind(&row.data)
        .bind(&row.signature)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(StoreError::not_found(&row.kind, &row.id));
        }
        Ok(())
    }

    async fn update_secrets(
        &mut self,
        kind: &str,
        id: &str,
        secrets: &SecretColumns,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE secured_records SET secrets = secrets || $3 WHERE kind = $1 AND id = $2",
        )
        .bind(kind)
        .bind(id)
        .bind(encode_secrets(secrets))
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(StoreError::not_found(kind, id));
        }
        Ok(())
    }

    async fn delete(&mut self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM secured_records WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
