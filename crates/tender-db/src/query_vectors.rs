//! User query vector repository implementation.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tender_core::{Error, QueryVectorRepository, Result, UserQueryVector};

/// PostgreSQL implementation of QueryVectorRepository.
#[derive(Clone)]
pub struct PgQueryVectorRepository {
    pool: PgPool,
}

impl PgQueryVectorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryVectorRepository for PgQueryVectorRepository {
    async fn get(&self, id: Uuid) -> Result<Option<UserQueryVector>> {
        let row = sqlx::query(
            "SELECT id, user_id, query, vector, created_at, updated_at, completed_at \
             FROM user_query_vector WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| {
            let vector: Option<Vector> = row.get("vector");
            UserQueryVector {
                id: row.get("id"),
                user_id: row.get("user_id"),
                query: row.get("query"),
                vector: vector.map(|v| v.to_vec()),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                completed_at: row.get("completed_at"),
            }
        }))
    }

    async fn upsert(&self, record: &UserQueryVector) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_query_vector (
                id, user_id, query, vector, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                query = EXCLUDED.query,
                vector = EXCLUDED.vector,
                updated_at = EXCLUDED.updated_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.query)
        .bind(record.vector.clone().map(Vector::from))
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}
