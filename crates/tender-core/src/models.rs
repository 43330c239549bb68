//! Persisted domain models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// NOTICES
// =============================================================================

/// Aggregate root for one purchase announcement, stable across amendments.
///
/// Everything apart from `id`, `external_id` and `created_at` is a
/// denormalized projection of the most recently ingested version and is
/// overwritten on every ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notice {
    pub id: Uuid,
    /// Identifier assigned by the publishing registry. Unique per notice.
    pub external_id: String,
    /// Feed the notice was imported from.
    pub source: String,
    /// Document type taken from the file name, e.g. `epNotificationEF2020`.
    pub document_type: String,
    /// Region code, or the "unknown" sentinel when the file name has none.
    pub region: i32,
    /// Publication period from the file name.
    pub period: NaiveDate,
    /// File name inside the archive the latest version came from.
    pub entry_name: String,
    /// Version number of the latest ingested revision.
    pub version_number: i32,
    pub purchase_number: Option<String>,
    pub document_number: Option<String>,
    pub publish_date: Option<DateTime<Utc>>,
    /// Public page of the notice on the registry site.
    pub href: Option<String>,
    /// Procurement method (auction, tender, request for quotations).
    pub placing_way_code: Option<String>,
    pub placing_way_name: Option<String>,
    /// Electronic trading platform hosting the procedure.
    pub etp_code: Option<String>,
    pub etp_name: Option<String>,
    pub etp_url: Option<String>,
    /// Contract is concluded under article 83, part 2 of the procurement law.
    pub contract_conclusion_on_st83_ch2: bool,
    /// Free-text description of the purchase; the embedding source.
    pub purchase_object_info: Option<String>,
    /// Initial maximum contract price, in `currency_code`.
    pub max_price: Option<f64>,
    pub currency_code: Option<String>,
    /// OKPD2 product classification of the purchase objects.
    pub okpd2_code: Option<String>,
    pub okpd2_name: Option<String>,
    /// KVR budget expense classification.
    pub kvr_code: Option<String>,
    pub kvr_name: Option<String>,
    /// Bid collection deadline of the latest version.
    pub collecting_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One revision of a notice, keyed by `(notice_id, version_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NoticeVersion {
    pub id: Uuid,
    pub notice_id: Uuid,
    pub external_id: String,
    pub version_number: i32,
    /// Exactly one version per notice is active.
    pub is_active: bool,
    /// Publication timestamp carried by the document itself.
    pub version_received_at: DateTime<Utc>,
    /// Document bytes as imported.
    #[serde(skip)]
    pub raw_content: Vec<u8>,
    /// Lowercase hex SHA-256 of `raw_content`.
    pub hash: String,
    pub inserted_at: DateTime<Utc>,
    /// Refreshed whenever an import sees this version again.
    pub last_seen_at: DateTime<Utc>,
    /// Archive entry the version was read from.
    pub source_file_name: Option<String>,
}

/// Bid collection window of one notice version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcedureWindow {
    pub notice_version_id: Uuid,
    pub collecting_start: Option<DateTime<Utc>>,
    pub collecting_end: Option<DateTime<Utc>>,
    /// Bidding date exactly as published, which is not always a timestamp.
    pub bidding_date_raw: Option<String>,
    /// Summarizing date exactly as published.
    pub summarizing_date_raw: Option<String>,
}

/// Attachment keyed by `(published_content_id, notice_version_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NoticeAttachment {
    pub id: Uuid,
    pub notice_version_id: Uuid,
    /// Registry identifier of the published file.
    pub published_content_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub description: Option<String>,
    pub document_date: Option<DateTime<Utc>>,
    pub document_kind_code: Option<String>,
    pub document_kind_name: Option<String>,
    /// Download link on the registry site.
    pub url: Option<String>,
    pub inserted_at: DateTime<Utc>,
    /// Refreshed when a later version still lists the attachment.
    pub last_seen_at: DateTime<Utc>,
    pub source_file_name: Option<String>,
}

/// Signature keyed by `(signature_type, signature_value)` within an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttachmentSignature {
    pub id: Uuid,
    pub attachment_id: Uuid,
    /// Signature format as published.
    pub signature_type: String,
    /// Signature body as published.
    pub signature_value: String,
}

impl AttachmentSignature {
    /// Natural key used when diffing signatures.
    pub fn key(&self) -> (&str, &str) {
        (&self.signature_type, &self.signature_value)
    }
}

/// An attachment together with its signatures.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttachment {
    pub attachment: NoticeAttachment,
    pub signatures: Vec<AttachmentSignature>,
}

/// Notice whose embedding still has to be computed.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct VectorCandidate {
    pub id: Uuid,
    /// Text sent to the embedding service.
    pub text: String,
}

// =============================================================================
// ANALYSES
// =============================================================================

/// Lifecycle of a per-user notice analysis.
///
/// Deserializes from the variant name (any case) or from its ordinal, since
/// producers on the other side of the broker emit either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AnalysisStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::NotStarted => "NotStarted",
            AnalysisStatus::InProgress => "InProgress",
            AnalysisStatus::Completed => "Completed",
            AnalysisStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notstarted" => Ok(AnalysisStatus::NotStarted),
            "inprogress" => Ok(AnalysisStatus::InProgress),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown analysis status: {}",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for AnalysisStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Ordinal(u8),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
            Raw::Ordinal(0) => Ok(AnalysisStatus::NotStarted),
            Raw::Ordinal(1) => Ok(AnalysisStatus::InProgress),
            Raw::Ordinal(2) => Ok(AnalysisStatus::Completed),
            Raw::Ordinal(3) => Ok(AnalysisStatus::Failed),
            Raw::Ordinal(n) => Err(serde::de::Error::custom(format!(
                "unknown analysis status ordinal: {}",
                n
            ))),
        }
    }
}

/// LLM analysis of one notice on behalf of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeAnalysis {
    pub id: Uuid,
    pub notice_id: Uuid,
    pub user_id: String,
    pub status: AnalysisStatus,
    /// Engine output. Set only when `status` is `Completed`.
    pub result: Option<String>,
    /// Last failure message. Cleared when a run is restarted.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every transition; the stuck sweep compares against it.
    pub updated_at: DateTime<Utc>,
    /// When the run reached `Completed` or `Failed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl NoticeAnalysis {
    /// Snapshot pushed to the owning user's sessions.
    pub fn status_view(&self) -> AnalysisStatusView {
        AnalysisStatusView {
            analysis_id: Some(self.id),
            notice_id: self.notice_id,
            user_id: self.user_id.clone(),
            status: self.status,
            has_result: self.result.as_deref().is_some_and(|r| !r.is_empty()),
            result: self.result.clone(),
            error: self.error.clone(),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Authoritative analysis status as seen by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStatusView {
    /// `None` when no analysis row exists yet.
    pub analysis_id: Option<Uuid>,
    pub notice_id: Uuid,
    pub user_id: String,
    pub status: AnalysisStatus,
    /// True when `result` is present and non-empty.
    pub has_result: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AnalysisStatusView {
    /// View for a (notice, user) pair that was never analysed.
    pub fn not_started(notice_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            analysis_id: None,
            notice_id,
            user_id: user_id.into(),
            status: AnalysisStatus::NotStarted,
            has_result: false,
            result: None,
            error: None,
            updated_at: None,
        }
    }
}

// =============================================================================
// QUERY VECTORS
// =============================================================================

/// Embedding of a user's saved search query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQueryVector {
    pub id: Uuid,
    pub user_id: String,
    /// Trimmed query text.
    pub query: String,
    /// `None` until the embedding service answers.
    pub vector: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the vector arrived.
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_status_round_trip_is_case_insensitive() {
        assert_eq!(
            "inprogress".parse::<AnalysisStatus>().unwrap(),
            AnalysisStatus::InProgress
        );
        assert_eq!(
            "Completed".parse::<AnalysisStatus>().unwrap(),
            AnalysisStatus::Completed
        );
        assert!("done".parse::<AnalysisStatus>().is_err());
    }

    #[test]
    fn test_analysis_status_deserializes_name_or_ordinal() {
        let by_name: AnalysisStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(by_name, AnalysisStatus::Failed);
        let by_ordinal: AnalysisStatus = serde_json::from_str("2").unwrap();
        assert_eq!(by_ordinal, AnalysisStatus::Completed);
        assert!(serde_json::from_str::<AnalysisStatus>("9").is_err());
        assert_eq!(
            serde_json::to_string(&AnalysisStatus::InProgress).unwrap(),
            r#""InProgress""#
        );
    }

    #[test]
    fn test_status_view_has_result() {
        let now = Utc::now();
        let analysis = NoticeAnalysis {
            id: Uuid::new_v4(),
            notice_id: Uuid::new_v4(),
            user_id: "u1".into(),
            status: AnalysisStatus::Completed,
            result: Some("{}".into()),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        };
        let view = analysis.status_view();
        assert!(view.has_result);
        assert_eq!(view.analysis_id, Some(analysis.id));

        let empty = NoticeAnalysis {
            result: Some(String::new()),
            ..analysis
        };
        assert!(!empty.status_view().has_result);
    }

    #[test]
    fn test_not_started_view() {
        let notice = Uuid::new_v4();
        let view = AnalysisStatusView::not_started(notice, "u2");
        assert_eq!(view.status, AnalysisStatus::NotStarted);
        assert!(view.analysis_id.is_none());
        assert_eq!(view.user_id, "u2");
    }
}
