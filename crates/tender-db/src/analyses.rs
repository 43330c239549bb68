//! Notice analysis repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tender_core::{AnalysisRepository, AnalysisStatus, Error, NoticeAnalysis, Result};

const ANALYSIS_COLUMNS: &str =
    "id, notice_id, user_id, status, result, error, created_at, updated_at, completed_at";

/// PostgreSQL implementation of AnalysisRepository.
#[derive(Clone)]
pub struct PgAnalysisRepository {
    pool: PgPool,
}

impl PgAnalysisRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<NoticeAnalysis> {
        let status: String = row.get("status");
        Ok(NoticeAnalysis {
            id: row.get("id"),
            notice_id: row.get("notice_id"),
            user_id: row.get("user_id"),
            status: status.parse()?,
            result: row.get("result"),
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        })
    }

    async fn finish(
        &self,
        analysis_id: Uuid,
        status: AnalysisStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<NoticeAnalysis> {
        let row = sqlx::query(&format!(
            "UPDATE notice_analysis SET status = $2, result = $3, error = $4, \
             updated_at = NOW(), completed_at = NOW() \
             WHERE id = $1 RETURNING {ANALYSIS_COLUMNS}"
        ))
        .bind(analysis_id)
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("analysis {}", analysis_id)))?;
        Self::parse_row(&row)
    }
}

#[async_trait]
impl AnalysisRepository for PgAnalysisRepository {
    async fn get(&self, analysis_id: Uuid) -> Result<Option<NoticeAnalysis>> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM notice_analysis WHERE id = $1"
        ))
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find(&self, notice_id: Uuid, user_id: &str) -> Result<Option<NoticeAnalysis>> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM notice_analysis WHERE notice_id = $1 AND user_id = $2"
        ))
        .bind(notice_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn begin(&self, notice_id: Uuid, user_id: &str) -> Result<NoticeAnalysis> {
        let row = sqlx::query(&format!(
            "INSERT INTO notice_analysis (id, notice_id, user_id, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, NOW(), NOW()) \
             ON CONFLICT (notice_id, user_id) DO UPDATE SET \
                status = EXCLUDED.status, result = NULL, error = NULL, \
                updated_at = NOW(), completed_at = NULL \
             RETURNING {ANALYSIS_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(notice_id)
        .bind(user_id)
        .bind(AnalysisStatus::InProgress.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Self::parse_row(&row)
    }

    async fn complete(&self, analysis_id: Uuid, result: &str) -> Result<NoticeAnalysis> {
        self.finish(analysis_id, AnalysisStatus::Completed, Some(result), None)
            .await
    }

    async fn fail(&self, analysis_id: Uuid, error: &str) -> Result<NoticeAnalysis> {
        self.finish(analysis_id, AnalysisStatus::Failed, None, Some(error))
            .await
    }

    async fn reset_stuck(
        &self,
        older_than: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<NoticeAnalysis>> {
        let rows = sqlx::query(&format!(
            "UPDATE notice_analysis SET status = $1, error = $2, updated_at = NOW() \
             WHERE status = $3 AND updated_at < $4 \
             RETURNING {ANALYSIS_COLUMNS}"
        ))
        .bind(AnalysisStatus::Failed.as_str())
        .bind(error)
        .bind(AnalysisStatus::InProgress.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_row).collect()
    }
}
