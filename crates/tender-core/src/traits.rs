//! Collaborator traits.
//!
//! Storage backends live in `tender-db`; parsers and extractors in
//! `tender-ingest`. Workers and services only ever see these traits.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::ingest::{IngestPlan, IngestReport, NoticeSnapshot};
use crate::models::{
    Notice, NoticeAnalysis, NoticeVersion, StoredAttachment, UserQueryVector, VectorCandidate,
};
use crate::notification::ExportDocument;

/// Persistence of notices, versions and attachments.
#[async_trait]
pub trait NoticeRepository: Send + Sync {
    /// Whether any stored version carries this content hash.
    async fn version_hash_exists(&self, hash: &str) -> Result<bool>;

    /// Current state of the notice with `external_id` (empty if unknown).
    async fn load_snapshot(&self, external_id: &str) -> Result<NoticeSnapshot>;

    /// Apply an ingestion plan as one unit of work.
    async fn apply(&self, plan: IngestPlan) -> Result<IngestReport>;

    async fn get(&self, notice_id: Uuid) -> Result<Option<Notice>>;

    async fn active_version(&self, notice_id: Uuid) -> Result<Option<NoticeVersion>>;

    async fn attachments(&self, notice_version_id: Uuid) -> Result<Vec<StoredAttachment>>;

    /// Notices without an embedding, ordered by id, strictly after `after`.
    async fn missing_vectors(&self, after: Option<Uuid>, limit: i64)
        -> Result<Vec<VectorCandidate>>;

    /// Store a notice embedding. Returns false if the notice does not exist.
    async fn set_vector(&self, notice_id: Uuid, vector: Vec<f32>) -> Result<bool>;
}

/// Persistence of per-user notice analyses.
#[async_trait]
pub trait AnalysisRepository: Send + Sync {
    async fn get(&self, analysis_id: Uuid) -> Result<Option<NoticeAnalysis>>;

    async fn find(&self, notice_id: Uuid, user_id: &str) -> Result<Option<NoticeAnalysis>>;

    /// Create or reset the (notice, user) analysis to InProgress.
    async fn begin(&self, notice_id: Uuid, user_id: &str) -> Result<NoticeAnalysis>;

    async fn complete(&self, analysis_id: Uuid, result: &str) -> Result<NoticeAnalysis>;

    async fn fail(&self, analysis_id: Uuid, error: &str) -> Result<NoticeAnalysis>;

    /// Mark every analysis still InProgress since before `older_than` as
    /// Failed with `error`, returning the rows that were reset.
    async fn reset_stuck(
        &self,
        older_than: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<NoticeAnalysis>>;
}

/// Persistence of user query embeddings.
#[async_trait]
pub trait QueryVectorRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<UserQueryVector>>;

    /// Insert or replace the record with the same id.
    async fn upsert(&self, record: &UserQueryVector) -> Result<()>;
}

/// Pure `bytes -> ExportDocument` parser.
pub trait NotificationParser: Send + Sync {
    fn parse(&self, content: &[u8]) -> Result<ExportDocument>;

    /// Extension (without dot) of files this parser understands.
    fn file_extension(&self) -> &str {
        crate::defaults::NOTIFICATION_EXTENSION
    }
}

/// Extracts an archive into a directory.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract `archive` into `destination`, returning the number of files written.
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<usize>;
}
