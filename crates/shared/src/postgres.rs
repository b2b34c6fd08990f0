//! PostgreSQL-backed [`DurableStore`].
//!
//! All kinds share one `entities` table with a JSONB body. Numeric ids come
//! from a single sequence, so they are unique across kinds as well.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPool, types::Json, Postgres, QueryBuilder};

use crate::store::{DurableStore, EntityKey, KeyId, Query, StoreError, StoreResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        kind TEXT NOT NULL,
        key_id BIGINT,
        key_name TEXT,
        body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK ((key_id IS NULL) <> (key_name IS NULL))
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS entities_kind_id ON entities (kind, key_id) WHERE key_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS entities_kind_name ON entities (kind, key_name) WHERE key_name IS NOT NULL",
    "CREATE SEQUENCE IF NOT EXISTS entity_ids",
];

type EntityRow = (String, Option<i64>, Option<String>, Json<Value>);

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(url).await.map_err(map_sqlx)?;
        tracing::info!("Database connection established");
        Ok(Self::new(pool))
    }

    /// Create the table, indexes and id sequence if they do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => StoreError::connection(err),
        other => StoreError::internal(other),
    }
}

fn split_key(key: &EntityKey) -> (Option<i64>, Option<&str>) {
    match &key.id {
        KeyId::Id(id) => (Some(*id), None),
        KeyId::Name(name) => (None, Some(name.as_str())),
    }
}

fn push_key_predicate<'a>(builder: &mut QueryBuilder<'a, Postgres>, key: &'a EntityKey) {
    builder.push(" WHERE kind = ").push_bind(key.kind.as_str());
    match &key.id {
        KeyId::Id(id) => builder.push(" AND key_id = ").push_bind(*id),
        KeyId::Name(name) => builder.push(" AND key_name = ").push_bind(name.as_str()),
    };
}

fn push_query_predicate<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a Query) {
    builder.push(" WHERE kind = ").push_bind(query.kind.as_str());
    for (field, value) in &query.filters {
        builder
            .push(" AND body -> ")
            .push_bind(field.as_str())
            .push(" = ")
            .push_bind(Json(value));
    }
}

fn row_key(kind: String, key_id: Option<i64>, key_name: Option<String>) -> StoreResult<EntityKey> {
    match (key_id, key_name) {
        (Some(id), None) => Ok(EntityKey::numeric(kind, id)),
        (None, Some(name)) => Ok(EntityKey::named(kind, name)),
        _ => Err(StoreError::Internal {
            message: format!("entity row of kind {} has an invalid key", kind),
            source: None,
        }),
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn get(&self, key: &EntityKey) -> StoreResult<Option<Value>> {
        let mut builder = QueryBuilder::new("SELECT body FROM entities");
        push_key_predicate(&mut builder, key);

        let row: Option<(Json<Value>,)> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|(Json(body),)| body))
    }

    async fn put(&self, key: &EntityKey, doc: Value) -> StoreResult<()> {
        let (key_id, key_name) = split_key(key);
        let conflict_target = match key.id {
            KeyId::Id(_) => "(kind, key_id) WHERE key_id IS NOT NULL",
            KeyId::Name(_) => "(kind, key_name) WHERE key_name IS NOT NULL",
        };

        let sql = format!(
            r#"
            INSERT INTO entities (kind, key_id, key_name, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT {}
            DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()
            "#,
            conflict_target
        );

        sqlx::query(&sql)
            .bind(&key.kind)
            .bind(key_id)
            .bind(key_name)
            .bind(Json(&doc))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete(&self, key: &EntityKey) -> StoreResult<bool> {
        let mut builder = QueryBuilder::new("DELETE FROM entities");
        push_key_predicate(&mut builder, key);

        let rows_affected = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn allocate_id(&self, _kind: &str) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT nextval('entity_ids')")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<(EntityKey, Value)>> {
        let mut builder = QueryBuilder::new("SELECT kind, key_id, key_name, body FROM entities");
        push_query_predicate(&mut builder, query);
        builder.push(" ORDER BY key_id ASC NULLS LAST, key_name ASC");
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<EntityRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.into_iter()
            .map(|(kind, key_id, key_name, Json(body))| {
                Ok((row_key(kind, key_id, key_name)?, body))
            })
            .collect()
    }

    async fn count(&self, query: &Query) -> StoreResult<usize> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM entities");
        push_query_predicate(&mut builder, query);

        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_requires_exactly_one_part() {
        assert_eq!(
            row_key("User".into(), Some(3), None).unwrap(),
            EntityKey::numeric("User", 3)
        );
        assert_eq!(
            row_key("Account".into(), None, Some("acme".into())).unwrap(),
            EntityKey::named("Account", "acme")
        );
        assert!(row_key("User".into(), Some(3), Some("x".into())).is_err());
        assert!(row_key("User".into(), None, None).is_err());
    }

    #[test]
    fn test_query_predicate_binds_filters() {
        let query = Query::kind("User")
            .filter("username", "ada")
            .filter("active", true);
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM entities");
        push_query_predicate(&mut builder, &query);

        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM entities WHERE kind = $1 AND body -> $2 = $3 AND body -> $4 = $5"
        );
    }
}
