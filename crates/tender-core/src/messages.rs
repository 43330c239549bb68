//! Task message contracts exchanged over the broker.
//!
//! Every queue carries exactly one contract. [`TaskMessage`] is the tagged
//! union the dispatcher publishes. Consumers decode the contract bound to
//! their queue with [`decode_payload`], which matches field names without
//! regard to case (or underscores) so producers written against other
//! naming conventions interoperate.
//!
//! Fields are serialized in PascalCase.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::AnalysisStatus;

/// Logical queues known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    FavoriteSearch,
    VectorRequest,
    VectorResult,
    AnalysisRequest,
    AnalysisResult,
}

impl QueueKind {
    pub const ALL: [QueueKind; 5] = [
        QueueKind::FavoriteSearch,
        QueueKind::VectorRequest,
        QueueKind::VectorResult,
        QueueKind::AnalysisRequest,
        QueueKind::AnalysisResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::FavoriteSearch => "favorite_search",
            QueueKind::VectorRequest => "vector_request",
            QueueKind::VectorResult => "vector_result",
            QueueKind::AnalysisRequest => "analysis_request",
            QueueKind::AnalysisResult => "analysis_result",
        }
    }
}

/// Request to run an LLM analysis of a notice for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalysisRequest {
    pub analysis_id: Uuid,
    pub notice_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub force: bool,
}

/// Completion signal for an analysis. Consumers treat it as a trigger to
/// re-read the stored status, not as the status itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalysisResult {
    #[serde(default)]
    pub analysis_id: Option<Uuid>,
    pub notice_id: Uuid,
    pub user_id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub has_result: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Re-execution of a saved ("favorite") search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FavoriteSearchCommand {
    pub user_id: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub query_vector_id: Option<Uuid>,
    pub collecting_end_limit: DateTime<Utc>,
    pub top: i32,
    pub limit: i32,
    #[serde(default)]
    pub expired_only: bool,
    pub similarity_threshold_percent: i32,
}

impl FavoriteSearchCommand {
    /// Deterministic key over the command's semantic parameters.
    ///
    /// The query is trimmed and lowercased. `top` and `limit` do not take
    /// part: two runs that differ only in those would produce the same work.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.user_id,
            self.query
                .as_deref()
                .map(|q| q.trim().to_lowercase())
                .unwrap_or_default(),
            self.query_vector_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            self.similarity_threshold_percent,
            self.collecting_end_limit
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            if self.expired_only { "expired" } else { "active" }
        )
    }
}

/// One text to embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VectorItem {
    pub id: Uuid,
    #[serde(default)]
    pub user_id: String,
    pub string: String,
}

/// Batch of texts for the embedding service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VectorBatchRequest {
    pub service_id: String,
    pub items: Vec<VectorItem>,
}

/// Embedding produced for one [`VectorItem`].
///
/// An empty `user_id` marks a notice embedding; otherwise the id refers to a
/// user query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VectorResult {
    pub id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

impl VectorResult {
    pub fn is_notice_embedding(&self) -> bool {
        self.user_id.as_deref().map_or(true, |u| u.trim().is_empty())
    }
}

/// Every payload that travels over the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessage {
    FavoriteSearch(FavoriteSearchCommand),
    VectorRequest(VectorBatchRequest),
    VectorResult(VectorResult),
    AnalysisRequest(AnalysisRequest),
    AnalysisResult(AnalysisResult),
}

impl TaskMessage {
    /// Queue this message belongs on.
    pub fn queue(&self) -> QueueKind {
        match self {
            TaskMessage::FavoriteSearch(_) => QueueKind::FavoriteSearch,
            TaskMessage::VectorRequest(_) => QueueKind::VectorRequest,
            TaskMessage::VectorResult(_) => QueueKind::VectorResult,
            TaskMessage::AnalysisRequest(_) => QueueKind::AnalysisRequest,
            TaskMessage::AnalysisResult(_) => QueueKind::AnalysisResult,
        }
    }

    /// JSON body of the message.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            TaskMessage::FavoriteSearch(m) => serde_json::to_vec(m)?,
            TaskMessage::VectorRequest(m) => serde_json::to_vec(m)?,
            TaskMessage::VectorResult(m) => serde_json::to_vec(m)?,
            TaskMessage::AnalysisRequest(m) => serde_json::to_vec(m)?,
            TaskMessage::AnalysisResult(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }

    /// Decode a payload received on `queue` into the contract bound to it.
    pub fn decode(queue: QueueKind, payload: &[u8]) -> Result<TaskMessage> {
        Ok(match queue {
            QueueKind::FavoriteSearch => TaskMessage::FavoriteSearch(decode_payload(payload)?),
            QueueKind::VectorRequest => TaskMessage::VectorRequest(decode_payload(payload)?),
            QueueKind::VectorResult => TaskMessage::VectorResult(decode_payload(payload)?),
            QueueKind::AnalysisRequest => TaskMessage::AnalysisRequest(decode_payload(payload)?),
            QueueKind::AnalysisResult => TaskMessage::AnalysisResult(decode_payload(payload)?),
        })
    }
}

/// Field names of every contract, in their serialized spelling.
const CONTRACT_FIELDS: &[&str] = &[
    "AnalysisId",
    "NoticeId",
    "UserId",
    "CreatedAt",
    "Force",
    "Status",
    "HasResult",
    "Error",
    "UpdatedAt",
    "Query",
    "QueryVectorId",
    "CollectingEndLimit",
    "Top",
    "Limit",
    "ExpiredOnly",
    "SimilarityThresholdPercent",
    "ServiceId",
    "Items",
    "Id",
    "String",
    "Vector",
];

fn fold(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn canonical_field(name: &str) -> Option<&'static str> {
    let folded = fold(name);
    CONTRACT_FIELDS.iter().copied().find(|f| fold(f) == folded)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let key = canonical_field(&key).map(str::to_string).unwrap_or(key);
                out.insert(key, canonicalize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Decode a contract with case-insensitive field matching.
///
/// Empty bodies and a JSON `null` are rejected, the same as malformed JSON.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::Serialization("empty payload".to_string()));
    }
    let value: Value = serde_json::from_slice(payload)?;
    if value.is_null() {
        return Err(Error::Serialization("null payload".to_string()));
    }
    Ok(serde_json::from_value(canonicalize(value))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn command() -> FavoriteSearchCommand {
        FavoriteSearchCommand {
            user_id: "u1".into(),
            query: Some("road repair".into()),
            query_vector_id: Some(Uuid::nil()),
            collecting_end_limit: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            top: 20,
            limit: 500,
            expired_only: false,
            similarity_threshold_percent: 70,
        }
    }

    #[test]
    fn test_decode_case_insensitive_fields() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"analysisId":"{id}","NOTICEID":"{id}","user_id":"u1","createdAt":"2025-01-01T00:00:00Z","force":true}}"#
        );
        let request: AnalysisRequest = decode_payload(json.as_bytes()).unwrap();
        assert_eq!(request.analysis_id, id);
        assert_eq!(request.notice_id, id);
        assert_eq!(request.user_id, "u1");
        assert!(request.force);
    }

    #[test]
    fn test_decode_nested_items() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"serviceId":"svc","items":[{{"id":"{id}","userId":"","string":"text"}}]}}"#);
        let batch: VectorBatchRequest = decode_payload(json.as_bytes()).unwrap();
        assert_eq!(batch.service_id, "svc");
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].string, "text");
    }

    #[test]
    fn test_decode_rejects_null_and_empty() {
        assert!(decode_payload::<VectorResult>(b"null").is_err());
        assert!(decode_payload::<VectorResult>(b"").is_err());
        assert!(decode_payload::<VectorResult>(b"   ").is_err());
        assert!(decode_payload::<VectorResult>(b"{not json").is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let err = decode_payload::<AnalysisResult>(br#"{"Foo":1}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_analysis_result_status_ordinal() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"NoticeId":"{id}","UserId":"u","Status":3,"UpdatedAt":"2025-01-01T00:00:00Z"}}"#
        );
        let result: AnalysisResult = decode_payload(json.as_bytes()).unwrap();
        assert_eq!(result.status, AnalysisStatus::Failed);
        assert!(!result.has_result);
        assert!(result.analysis_id.is_none());
    }

    #[test]
    fn test_serializes_pascal_case() {
        let json = TaskMessage::FavoriteSearch(command()).to_json().unwrap();
        let value: Value = serde_json::from_slice(&json).unwrap();
        assert!(value.get("UserId").is_some());
        assert!(value.get("SimilarityThresholdPercent").is_some());
    }

    #[test]
    fn test_task_message_decode_by_queue() {
        let original = TaskMessage::FavoriteSearch(command());
        let bytes = original.to_json().unwrap();
        let decoded = TaskMessage::decode(QueueKind::FavoriteSearch, &bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.queue(), QueueKind::FavoriteSearch);
        assert!(TaskMessage::decode(QueueKind::AnalysisRequest, &bytes).is_err());
    }

    #[test]
    fn test_dedup_key_format() {
        assert_eq!(
            command().dedup_key(),
            "u1:road repair:00000000-0000-0000-0000-000000000000:70:2025-03-01T12:00:00.000Z:active"
        );
    }

    #[test]
    fn test_dedup_key_ignores_top_limit_and_query_case() {
        let a = command();
        let b = FavoriteSearchCommand {
            top: 5,
            limit: 50,
            query: Some("  Road Repair ".into()),
            ..command()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());

        let other_query = FavoriteSearchCommand {
            query: Some("medical equipment".into()),
            ..command()
        };
        assert_ne!(a.dedup_key(), other_query.dedup_key());

        let expired = FavoriteSearchCommand {
            expired_only: true,
            ..command()
        };
        assert_ne!(a.dedup_key(), expired.dedup_key());
    }

    #[test]
    fn test_notice_embedding_detection() {
        let mut result = VectorResult {
            id: Uuid::nil(),
            user_id: None,
            query: None,
            vector: Some(vec![0.1]),
        };
        assert!(result.is_notice_embedding());
        result.user_id = Some(" ".into());
        assert!(result.is_notice_embedding());
        result.user_id = Some("u1".into());
        assert!(!result.is_notice_embedding());
    }
}
