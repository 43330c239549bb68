//! In-process store.
//!
//! Implements every repository trait over plain maps behind one mutex, so a
//! plan is applied all-or-nothing exactly like the PostgreSQL transaction.
//! Used for single-process runs without a database and by the test suites of
//! the other crates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tender_core::{
    AnalysisRepository, AnalysisStatus, AttachmentSignature, Error, IngestPlan, IngestReport,
    Notice, NoticeAnalysis, NoticeAttachment, NoticeRepository, NoticeSnapshot, NoticeVersion,
    ProcedureWindow, QueryVectorRepository, Result, StoredAttachment, UserQueryVector,
    VectorCandidate,
};

#[derive(Default)]
struct State {
    notices: HashMap<Uuid, Notice>,
    external_ids: HashMap<String, Uuid>,
    notice_vectors: HashMap<Uuid, Vec<f32>>,
    versions: HashMap<Uuid, NoticeVersion>,
    windows: HashMap<Uuid, ProcedureWindow>,
    attachments: HashMap<Uuid, NoticeAttachment>,
    signatures: HashMap<Uuid, AttachmentSignature>,
    analyses: HashMap<Uuid, NoticeAnalysis>,
    query_vectors: HashMap<Uuid, UserQueryVector>,
    writes: u64,
}

impl State {
    fn stored_attachment(&self, attachment: &NoticeAttachment) -> StoredAttachment {
        let mut signatures: Vec<AttachmentSignature> = self
            .signatures
            .values()
            .filter(|s| s.attachment_id == attachment.id)
            .cloned()
            .collect();
        signatures.sort_by(|a, b| a.key().cmp(&b.key()));
        StoredAttachment {
            attachment: attachment.clone(),
            signatures,
        }
    }

    fn version_ids_of(&self, notice_id: Uuid) -> Vec<Uuid> {
        self.versions
            .values()
            .filter(|v| v.notice_id == notice_id)
            .map(|v| v.id)
            .collect()
    }

    fn insert_signatures(&mut self, attachment_id: Uuid, signatures: &[AttachmentSignature]) {
        for signature in signatures {
            let duplicate = self.signatures.values().any(|s| {
                s.attachment_id == attachment_id && s.key() == signature.key()
            });
            if !duplicate {
                let mut signature = signature.clone();
                signature.attachment_id = attachment_id;
                self.signatures.insert(signature.id, signature);
            }
        }
    }
}

/// Map-backed implementation of the notice, analysis and query-vector stores.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of committed write operations (ingest plans, analysis and
    /// vector updates).
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Insert a notice directly, bypassing ingestion.
    pub fn insert_notice(&self, notice: Notice) {
        let mut state = self.lock();
        state
            .external_ids
            .insert(notice.external_id.clone(), notice.id);
        state.notices.insert(notice.id, notice);
    }

    /// All versions of the notice with `external_id`, ordered by number.
    pub fn versions_of(&self, external_id: &str) -> Vec<NoticeVersion> {
        let state = self.lock();
        let Some(notice_id) = state.external_ids.get(external_id).copied() else {
            return Vec::new();
        };
        let mut versions: Vec<NoticeVersion> = state
            .versions
            .values()
            .filter(|v| v.notice_id == notice_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        versions
    }

    /// All attachments of the notice with `external_id`, by content id.
    pub fn attachments_of(&self, external_id: &str) -> Vec<StoredAttachment> {
        let state = self.lock();
        let Some(notice_id) = state.external_ids.get(external_id).copied() else {
            return Vec::new();
        };
        let version_ids = state.version_ids_of(notice_id);
        let mut attachments: Vec<StoredAttachment> = state
            .attachments
            .values()
            .filter(|a| version_ids.contains(&a.notice_version_id))
            .map(|a| state.stored_attachment(a))
            .collect();
        attachments.sort_by(|a, b| {
            a.attachment
                .published_content_id
                .cmp(&b.attachment.published_content_id)
        });
        attachments
    }

    pub fn notice_by_external_id(&self, external_id: &str) -> Option<Notice> {
        let state = self.lock();
        let id = state.external_ids.get(external_id)?;
        state.notices.get(id).cloned()
    }

    pub fn procedure_window(&self, notice_version_id: Uuid) -> Option<ProcedureWindow> {
        self.lock().windows.get(&notice_version_id).cloned()
    }

    pub fn notice_vector(&self, notice_id: Uuid) -> Option<Vec<f32>> {
        self.lock().notice_vectors.get(&notice_id).cloned()
    }

    pub fn signature_count(&self) -> usize {
        self.lock().signatures.len()
    }

    /// Overwrite an analysis row, e.g. to age it for sweep tests.
    pub fn put_analysis(&self, analysis: NoticeAnalysis) {
        self.lock().analyses.insert(analysis.id, analysis);
    }
}

#[async_trait]
impl NoticeRepository for MemoryDatabase {
    async fn version_hash_exists(&self, hash: &str) -> Result<bool> {
        Ok(self.lock().versions.values().any(|v| v.hash == hash))
    }

    async fn load_snapshot(&self, external_id: &str) -> Result<NoticeSnapshot> {
        let state = self.lock();
        let Some(notice) = state
            .external_ids
            .get(external_id)
            .and_then(|id| state.notices.get(id))
            .cloned()
        else {
            return Ok(NoticeSnapshot::default());
        };

        let mut versions: Vec<NoticeVersion> = state
            .versions
            .values()
            .filter(|v| v.notice_id == notice.id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);

        let version_ids: Vec<Uuid> = versions.iter().map(|v| v.id).collect();
        let attachments = state
            .attachments
            .values()
            .filter(|a| version_ids.contains(&a.notice_version_id))
            .map(|a| state.stored_attachment(a))
            .collect();

        Ok(NoticeSnapshot {
            notice: Some(notice),
            versions,
            attachments,
        })
    }

    async fn apply(&self, plan: IngestPlan) -> Result<IngestReport> {
        let mut state = self.lock();

        let existing_notice = state.external_ids.get(&plan.notice.external_id).copied();
        let notice_created = existing_notice.is_none();
        let notice_id = existing_notice.unwrap_or(plan.notice.id);
        let mut notice = plan.notice.clone();
        notice.id = notice_id;
        if let Some(previous) = state.notices.get(&notice_id) {
            notice.created_at = previous.created_at;
        }
        state.external_ids.insert(notice.external_id.clone(), notice_id);
        state.notices.insert(notice_id, notice);

        let existing_version = state
            .versions
            .values()
            .find(|v| v.notice_id == notice_id && v.version_number == plan.version.version_number)
            .map(|v| v.id);
        let version_created = existing_version.is_none();
        let version_id = match existing_version {
            Some(id) => {
                let incoming = &plan.version;
                if let Some(version) = state.versions.get_mut(&id) {
                    version.version_received_at = incoming.version_received_at;
                    version.raw_content = incoming.raw_content.clone();
                    version.hash = incoming.hash.clone();
                    version.last_seen_at = incoming.last_seen_at;
                    version.source_file_name = incoming.source_file_name.clone();
                }
                id
            }
            None => {
                let mut version = plan.version.clone();
                version.notice_id = notice_id;
                version.is_active = false;
                state.versions.insert(version.id, version.clone());
                version.id
            }
        };

        if plan.version.is_active {
            for version in state.versions.values_mut() {
                if version.notice_id != notice_id {
                    continue;
                }
                if version.id == version_id {
                    version.is_active = true;
                } else if plan.deactivate_siblings {
                    version.is_active = false;
                }
            }
        }

        if let Some(window) = &plan.procedure_window {
            let mut window = window.clone();
            window.notice_version_id = version_id;
            state.windows.insert(version_id, window);
        }

        let changes = &plan.attachments;
        for id in &changes.delete {
            state.attachments.remove(id);
            state.signatures.retain(|_, s| s.attachment_id != *id);
        }
        for update in &changes.update {
            let mut attachment = update.attachment.clone();
            attachment.notice_version_id = version_id;
            state.attachments.insert(attachment.id, attachment.clone());
            for id in &update.delete_signatures {
                state.signatures.remove(id);
            }
            state.insert_signatures(attachment.id, &update.insert_signatures);
        }
        for stored in &changes.insert {
            let mut attachment = stored.attachment.clone();
            attachment.notice_version_id = version_id;
            state.attachments.insert(attachment.id, attachment.clone());
            state.insert_signatures(attachment.id, &stored.signatures);
        }

        state.writes += 1;

        Ok(IngestReport {
            notice_id,
            version_id,
            notice_created,
            version_created,
            version_active: plan.version.is_active,
            attachments_inserted: changes.insert.len(),
            attachments_updated: changes.update.len(),
            attachments_deleted: changes.delete.len(),
        })
    }

    async fn get(&self, notice_id: Uuid) -> Result<Option<Notice>> {
        Ok(self.lock().notices.get(&notice_id).cloned())
    }

    async fn active_version(&self, notice_id: Uuid) -> Result<Option<NoticeVersion>> {
        Ok(self
            .lock()
            .versions
            .values()
            .find(|v| v.notice_id == notice_id && v.is_active)
            .cloned())
    }

    async fn attachments(&self, notice_version_id: Uuid) -> Result<Vec<StoredAttachment>> {
        let state = self.lock();
        let mut attachments: Vec<StoredAttachment> = state
            .attachments
            .values()
            .filter(|a| a.notice_version_id == notice_version_id)
            .map(|a| state.stored_attachment(a))
            .collect();
        attachments.sort_by(|a, b| {
            a.attachment
                .published_content_id
                .cmp(&b.attachment.published_content_id)
        });
        Ok(attachments)
    }

    async fn missing_vectors(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<VectorCandidate>> {
        let state = self.lock();
        let mut candidates: Vec<VectorCandidate> = state
            .notices
            .values()
            .filter(|n| !state.notice_vectors.contains_key(&n.id))
            .filter(|n| after.map_or(true, |after| n.id > after))
            .filter_map(|n| {
                let text = n.purchase_object_info.as_deref()?;
                (!text.is_empty()).then(|| VectorCandidate {
                    id: n.id,
                    text: text.to_string(),
                })
            })
            .collect();
        candidates.sort_by_key(|c| c.id);
        candidates.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(candidates)
    }

    async fn set_vector(&self, notice_id: Uuid, vector: Vec<f32>) -> Result<bool> {
        let mut state = self.lock();
        if !state.notices.contains_key(&notice_id) {
            return Ok(false);
        }
        state.notice_vectors.insert(notice_id, vector);
        state.writes += 1;
        Ok(true)
    }
}

impl MemoryDatabase {
    fn finish(
        &self,
        analysis_id: Uuid,
        status: AnalysisStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<NoticeAnalysis> {
        let mut state = self.lock();
        let analysis = state
            .analyses
            .get_mut(&analysis_id)
            .ok_or_else(|| Error::NotFound(format!("analysis {}", analysis_id)))?;
        let now = Utc::now();
        analysis.status = status;
        analysis.result = result.map(str::to_string);
        analysis.error = error.map(str::to_string);
        analysis.updated_at = now;
        analysis.completed_at = Some(now);
        let snapshot = analysis.clone();
        state.writes += 1;
        Ok(snapshot)
    }
}

#[async_trait]
impl AnalysisRepository for MemoryDatabase {
    async fn get(&self, analysis_id: Uuid) -> Result<Option<NoticeAnalysis>> {
        Ok(self.lock().analyses.get(&analysis_id).cloned())
    }

    async fn find(&self, notice_id: Uuid, user_id: &str) -> Result<Option<NoticeAnalysis>> {
        Ok(self
            .lock()
            .analyses
            .values()
            .find(|a| a.notice_id == notice_id && a.user_id == user_id)
            .cloned())
    }

    async fn begin(&self, notice_id: Uuid, user_id: &str) -> Result<NoticeAnalysis> {
        let mut state = self.lock();
        let now = Utc::now();
        let existing = state
            .analyses
            .values_mut()
            .find(|a| a.notice_id == notice_id && a.user_id == user_id);
        let analysis = match existing {
            Some(analysis) => {
                analysis.status = AnalysisStatus::InProgress;
                analysis.result = None;
                analysis.error = None;
                analysis.updated_at = now;
                analysis.completed_at = None;
                analysis.clone()
            }
            None => {
                let analysis = NoticeAnalysis {
                    id: Uuid::new_v4(),
                    notice_id,
                    user_id: user_id.to_string(),
                    status: AnalysisStatus::InProgress,
                    result: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                };
                state.analyses.insert(analysis.id, analysis.clone());
                analysis
            }
        };
        state.writes += 1;
        Ok(analysis)
    }

    async fn complete(&self, analysis_id: Uuid, result: &str) -> Result<NoticeAnalysis> {
        self.finish(analysis_id, AnalysisStatus::Completed, Some(result), None)
    }

    async fn fail(&self, analysis_id: Uuid, error: &str) -> Result<NoticeAnalysis> {
        self.finish(analysis_id, AnalysisStatus::Failed, None, Some(error))
    }

    async fn reset_stuck(
        &self,
        older_than: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<NoticeAnalysis>> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut reset = Vec::new();
        for analysis in state.analyses.values_mut() {
            if analysis.status == AnalysisStatus::InProgress && analysis.updated_at < older_than {
                analysis.status = AnalysisStatus::Failed;
                analysis.error = Some(error.to_string());
                analysis.updated_at = now;
                reset.push(analysis.clone());
            }
        }
        if !reset.is_empty() {
            state.writes += 1;
        }
        Ok(reset)
    }
}

#[async_trait]
impl QueryVectorRepository for MemoryDatabase {
    async fn get(&self, id: Uuid) -> Result<Option<UserQueryVector>> {
        Ok(self.lock().query_vectors.get(&id).cloned())
    }

    async fn upsert(&self, record: &UserQueryVector) -> Result<()> {
        let mut state = self.lock();
        state.query_vectors.insert(record.id, record.clone());
        state.writes += 1;
        Ok(())
    }
}
