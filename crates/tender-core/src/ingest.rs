//! Ingestion inputs, store snapshots, and the unit-of-work plan.
//!
//! The ingestor reads a [`NoticeSnapshot`], computes an [`IngestPlan`] in
//! memory, and hands the plan to the store, which applies it in a single
//! transaction. Keeping the diff pure means it can be tested without a
//! database and the store only has to know how to write rows.

use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::models::{
    AttachmentSignature, Notice, NoticeAttachment, NoticeVersion, ProcedureWindow,
    StoredAttachment,
};

/// Metadata derived from the file that carried a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    pub document_type: String,
    pub region: i32,
    pub period: NaiveDate,
    /// Path of the file relative to the import root, `/`-separated.
    pub entry_name: String,
}

/// Raw notification bytes plus everything known about where they came from.
#[derive(Debug, Clone)]
pub struct NoticeDocument {
    pub content: Vec<u8>,
    /// Lowercase hex SHA-256 of `content`.
    pub hash: String,
    pub metadata: DocumentMetadata,
    pub source_file_name: Option<String>,
}

/// Which version becomes active when a version is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivationPolicy {
    /// The most recently ingested version wins, whatever its number.
    #[default]
    LastIngested,
    /// A version only becomes active if no numerically higher version exists.
    HighestVersion,
}

impl FromStr for ActivationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "lastingested" => Ok(ActivationPolicy::LastIngested),
            "highestversion" => Ok(ActivationPolicy::HighestVersion),
            other => Err(Error::Config(format!(
                "unknown activation policy: {}",
                other
            ))),
        }
    }
}

/// Everything the store holds for one external id.
#[derive(Debug, Clone, Default)]
pub struct NoticeSnapshot {
    pub notice: Option<Notice>,
    pub versions: Vec<NoticeVersion>,
    /// Attachments across all versions of the notice.
    pub attachments: Vec<StoredAttachment>,
}

impl NoticeSnapshot {
    pub fn version(&self, version_number: i32) -> Option<&NoticeVersion> {
        self.versions
            .iter()
            .find(|v| v.version_number == version_number)
    }

    pub fn active_version(&self) -> Option<&NoticeVersion> {
        self.versions.iter().find(|v| v.is_active)
    }

    pub fn highest_version_number(&self) -> Option<i32> {
        self.versions.iter().map(|v| v.version_number).max()
    }
}

/// Update of an attachment that is present in both the store and the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentUpdate {
    pub attachment: NoticeAttachment,
    pub insert_signatures: Vec<AttachmentSignature>,
    pub delete_signatures: Vec<Uuid>,
}

/// Set-diff of stored attachments against the incoming payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentChanges {
    pub insert: Vec<StoredAttachment>,
    pub update: Vec<AttachmentUpdate>,
    /// Attachment ids to delete together with their signatures.
    pub delete: Vec<Uuid>,
}

impl AttachmentChanges {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// All writes for one ingestion. Applied atomically by the store.
#[derive(Debug, Clone)]
pub struct IngestPlan {
    /// Desired notice row. `id` is the stored id or a fresh one.
    pub notice: Notice,
    pub notice_exists: bool,
    /// Desired version row. `id` is the stored id or a fresh one.
    pub version: NoticeVersion,
    pub version_exists: bool,
    /// Set every other version of the notice inactive.
    pub deactivate_siblings: bool,
    pub procedure_window: Option<ProcedureWindow>,
    pub attachments: AttachmentChanges,
}

/// What a committed plan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub notice_id: Uuid,
    pub version_id: Uuid,
    pub notice_created: bool,
    pub version_created: bool,
    pub version_active: bool,
    pub attachments_inserted: usize,
    pub attachments_updated: usize,
    pub attachments_deleted: usize,
}
