//! Notice ingestor: versioning and attachment diff.
//!
//! [`NoticeIngestor::process`] parses a document, loads what the store holds
//! for the notice, and builds an [`IngestPlan`] that the store applies as one
//! unit of work. Planning is pure; see [`build_plan`], [`diff_attachments`]
//! and [`extract_classification`].
//!
//! A document whose version already exists with the same content hash is
//! reported as [`IngestOutcome::Unchanged`] and nothing is written.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use tender_core::{
    ActivationPolicy, AttachmentChanges, AttachmentInfo, AttachmentSignature, AttachmentUpdate,
    CodeName, CommonInfo, IngestPlan, IngestReport, Notice, NoticeAttachment, NoticeDocument,
    NoticeRepository, NoticeSnapshot, NoticeVersion, Notification, NotificationInfo,
    NotificationParser, ProcedureWindow, Result, SignatureInfo, StoredAttachment,
};

/// Why a document was skipped without touching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingNotification,
    MissingCommonInfo,
    MissingExternalId,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingNotification => "missing notification",
            SkipReason::MissingCommonInfo => "missing common info",
            SkipReason::MissingExternalId => "missing external id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested(IngestReport),
    /// The version is already stored with identical content.
    Unchanged {
        external_id: String,
        version_number: i32,
    },
    Skipped(SkipReason),
}

/// First non-empty OKPD2 and KVR classification of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub okpd2: Option<CodeName>,
    pub kvr: Option<CodeName>,
}

pub struct NoticeIngestor {
    notices: Arc<dyn NoticeRepository>,
    parser: Arc<dyn NotificationParser>,
    policy: ActivationPolicy,
}

impl NoticeIngestor {
    pub fn new(notices: Arc<dyn NoticeRepository>, parser: Arc<dyn NotificationParser>) -> Self {
        Self {
            notices,
            parser,
            policy: ActivationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ActivationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn file_extension(&self) -> &str {
        self.parser.file_extension()
    }

    #[instrument(
        skip(self, document),
        fields(subsystem = "ingest", component = "ingestor", entry = %document.metadata.entry_name)
    )]
    pub async fn process(&self, document: &NoticeDocument) -> Result<IngestOutcome> {
        let start = Instant::now();
        let export = self.parser.parse(&document.content)?;

        let Some(notification) = export.notification else {
            return Ok(skip(SkipReason::MissingNotification));
        };
        let Some(common) = notification.common_info.as_ref() else {
            return Ok(skip(SkipReason::MissingCommonInfo));
        };
        let Some(external_id) = resolve_external_id(&notification, common, &document.metadata.entry_name)
        else {
            return Ok(skip(SkipReason::MissingExternalId));
        };

        let version_number = notification.version_number.unwrap_or(0);
        let snapshot = self.notices.load_snapshot(&external_id).await?;
        if snapshot
            .version(version_number)
            .is_some_and(|v| v.hash == document.hash)
        {
            debug!(
                external_id = %external_id,
                version_number,
                "Version unchanged, nothing to write"
            );
            return Ok(IngestOutcome::Unchanged {
                external_id,
                version_number,
            });
        }

        let plan = build_plan(
            document,
            &notification,
            common,
            &external_id,
            &snapshot,
            self.policy,
            Utc::now(),
        );
        let report = self.notices.apply(plan).await?;

        info!(
            notice_id = %report.notice_id,
            external_id = %external_id,
            version_number,
            notice_created = report.notice_created,
            version_created = report.version_created,
            version_active = report.version_active,
            attachments_inserted = report.attachments_inserted,
            attachments_updated = report.attachments_updated,
            attachments_deleted = report.attachments_deleted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Notice ingested"
        );
        Ok(IngestOutcome::Ingested(report))
    }
}

fn skip(reason: SkipReason) -> IngestOutcome {
    info!(reason = reason.as_str(), "Document skipped");
    IngestOutcome::Skipped(reason)
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// External id: explicit id, then alternate id, then purchase number, then
/// the file name the document came from.
pub fn resolve_external_id(
    notification: &Notification,
    common: &CommonInfo,
    entry_name: &str,
) -> Option<String> {
    clean(notification.id.as_deref())
        .or_else(|| clean(notification.external_id.as_deref()))
        .or_else(|| clean(common.purchase_number.as_deref()))
        .or_else(|| {
            clean(
                Path::new(entry_name)
                    .file_stem()
                    .and_then(|s| s.to_str()),
            )
        })
}

fn non_empty_candidate(candidate: &CodeName) -> Option<CodeName> {
    candidate.non_empty_code().map(|code| CodeName {
        code: Some(code.to_string()),
        name: clean(candidate.name.as_deref()),
    })
}

/// Walk customer requirements, then purchase objects, taking the first
/// non-empty OKPD2 and KVR. Stops as soon as both are found.
pub fn extract_classification(info: &NotificationInfo) -> Classification {
    let mut found = Classification::default();

    for requirement in &info.customer_requirements {
        if found.okpd2.is_none() {
            found.okpd2 = requirement.okpd2.iter().find_map(non_empty_candidate);
        }
        if found.kvr.is_none() {
            found.kvr = requirement.kvr.iter().find_map(non_empty_candidate);
        }
        if found.okpd2.is_some() && found.kvr.is_some() {
            return found;
        }
    }

    if found.okpd2.is_none() {
        found.okpd2 = info
            .purchase_objects
            .iter()
            .filter_map(|o| o.okpd2.as_ref())
            .find_map(non_empty_candidate);
    }
    found
}

/// Plan every write for one document.
///
/// Under [`ActivationPolicy::LastIngested`] the incoming version always
/// becomes active. Under [`ActivationPolicy::HighestVersion`] a version lower
/// than the highest stored one is saved inactive, and the notice projection
/// and attachments stay with the active version.
pub fn build_plan(
    document: &NoticeDocument,
    notification: &Notification,
    common: &CommonInfo,
    external_id: &str,
    snapshot: &NoticeSnapshot,
    policy: ActivationPolicy,
    now: DateTime<Utc>,
) -> IngestPlan {
    let version_number = notification.version_number.unwrap_or(0);
    let activate = match policy {
        ActivationPolicy::LastIngested => true,
        ActivationPolicy::HighestVersion => snapshot
            .highest_version_number()
            .map_or(true, |highest| version_number >= highest),
    };

    let notice = match (&snapshot.notice, activate) {
        (Some(stored), false) => Notice {
            updated_at: now,
            ..stored.clone()
        },
        (stored, _) => build_notice(
            document,
            notification,
            common,
            external_id,
            stored.as_ref(),
            now,
        ),
    };

    let existing = snapshot.version(version_number);
    let version = NoticeVersion {
        id: existing.map_or_else(Uuid::new_v4, |v| v.id),
        notice_id: notice.id,
        external_id: external_id.to_string(),
        version_number,
        is_active: activate,
        version_received_at: now,
        raw_content: document.content.clone(),
        hash: document.hash.clone(),
        inserted_at: existing.map_or(now, |v| v.inserted_at),
        last_seen_at: now,
        source_file_name: document.source_file_name.clone(),
    };

    let procedure_window = notification
        .notification_info
        .as_ref()
        .and_then(|info| info.procedure_info.as_ref())
        .map(|p| ProcedureWindow {
            notice_version_id: version.id,
            collecting_start: p.collecting_start,
            collecting_end: p.collecting_end,
            bidding_date_raw: clean(p.bidding_date.as_deref()),
            summarizing_date_raw: clean(p.summarizing_date.as_deref()),
        });

    let attachments = if activate {
        diff_attachments(
            &snapshot.attachments,
            &notification.attachments,
            version.id,
            now,
            document.source_file_name.as_deref(),
        )
    } else {
        AttachmentChanges::default()
    };

    IngestPlan {
        notice_exists: snapshot.notice.is_some(),
        notice,
        version_exists: existing.is_some(),
        deactivate_siblings: activate,
        version,
        procedure_window,
        attachments,
    }
}

fn build_notice(
    document: &NoticeDocument,
    notification: &Notification,
    common: &CommonInfo,
    external_id: &str,
    stored: Option<&Notice>,
    now: DateTime<Utc>,
) -> Notice {
    let metadata = &document.metadata;
    let info = notification.notification_info.as_ref();
    let classification = info.map(extract_classification).unwrap_or_default();
    let max_price = info.and_then(|i| i.max_price.as_ref());
    let placing_way = common.placing_way.as_ref();
    let etp = common.etp.as_ref();
    let (okpd2_code, okpd2_name) = split(classification.okpd2);
    let (kvr_code, kvr_name) = split(classification.kvr);

    Notice {
        id: stored.map_or_else(Uuid::new_v4, |n| n.id),
        external_id: external_id.to_string(),
        source: metadata.source.clone(),
        document_type: metadata.document_type.clone(),
        region: metadata.region,
        period: metadata.period,
        entry_name: metadata.entry_name.clone(),
        version_number: notification.version_number.unwrap_or(0),
        purchase_number: clean(common.purchase_number.as_deref()),
        document_number: clean(common.doc_number.as_deref()),
        publish_date: common.publish_dt_in_eis,
        href: clean(common.href.as_deref()),
        placing_way_code: placing_way.and_then(|p| clean(p.code.as_deref())),
        placing_way_name: placing_way.and_then(|p| clean(p.name.as_deref())),
        etp_code: etp.and_then(|e| clean(e.code.as_deref())),
        etp_name: etp.and_then(|e| clean(e.name.as_deref())),
        etp_url: etp.and_then(|e| clean(e.url.as_deref())),
        contract_conclusion_on_st83_ch2: common.contract_conclusion_on_st83_ch2.unwrap_or(false),
        purchase_object_info: clean(common.purchase_object_info.as_deref()),
        max_price: max_price.and_then(|p| p.amount),
        currency_code: max_price.and_then(|p| clean(p.currency_code.as_deref())),
        okpd2_code,
        okpd2_name,
        kvr_code,
        kvr_name,
        collecting_end: info
            .and_then(|i| i.procedure_info.as_ref())
            .and_then(|p| p.collecting_end),
        created_at: stored.map_or(now, |n| n.created_at),
        updated_at: now,
    }
}

fn split(candidate: Option<CodeName>) -> (Option<String>, Option<String>) {
    match candidate {
        Some(c) => (c.code, c.name),
        None => (None, None),
    }
}

fn signature_key(sign: &SignatureInfo) -> Option<(String, String)> {
    let value = clean(sign.value.as_deref())?;
    Some((clean(sign.kind.as_deref()).unwrap_or_default(), value))
}

/// Incoming signatures keyed by `(type, value)`, first occurrence wins.
fn incoming_signatures(signs: &[SignatureInfo]) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    signs
        .iter()
        .filter_map(signature_key)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

fn new_signature(attachment_id: Uuid, (kind, value): (String, String)) -> AttachmentSignature {
    AttachmentSignature {
        id: Uuid::new_v4(),
        attachment_id,
        signature_type: kind,
        signature_value: value,
    }
}

fn apply_info(attachment: &mut NoticeAttachment, info: &AttachmentInfo) {
    attachment.file_name = clean(info.file_name.as_deref());
    attachment.file_size = info.file_size;
    attachment.description = clean(info.doc_description.as_deref());
    attachment.document_date = info.doc_date;
    attachment.url = clean(info.url.as_deref());
    attachment.document_kind_code = info.doc_kind.as_ref().and_then(|k| clean(k.code.as_deref()));
    attachment.document_kind_name = info.doc_kind.as_ref().and_then(|k| clean(k.name.as_deref()));
}

/// Set-diff of the stored attachments of a notice against the incoming list.
///
/// The key is the published content id. Stored attachments that are missing
/// from the payload (or duplicate a key) are deleted with their signatures.
/// Matched ones are moved to `version_id` and refreshed, with their
/// signatures diffed by `(type, value)`. The rest are inserted.
pub fn diff_attachments(
    stored: &[StoredAttachment],
    incoming: &[AttachmentInfo],
    version_id: Uuid,
    now: DateTime<Utc>,
    source_file_name: Option<&str>,
) -> AttachmentChanges {
    let mut wanted: Vec<(String, &AttachmentInfo)> = Vec::new();
    let mut wanted_index: HashMap<String, usize> = HashMap::new();
    for info in incoming {
        let Some(key) = clean(info.published_content_id.as_deref()) else {
            continue;
        };
        if !wanted_index.contains_key(&key) {
            wanted_index.insert(key.clone(), wanted.len());
            wanted.push((key, info));
        }
    }

    let mut changes = AttachmentChanges::default();
    let mut matched: HashSet<String> = HashSet::new();

    for existing in stored {
        let key = existing.attachment.published_content_id.trim().to_string();
        let info = match wanted_index.get(&key) {
            Some(&index) if !matched.contains(&key) => wanted[index].1,
            _ => {
                changes.delete.push(existing.attachment.id);
                continue;
            }
        };
        matched.insert(key);

        let mut attachment = existing.attachment.clone();
        apply_info(&mut attachment, info);
        attachment.notice_version_id = version_id;
        attachment.last_seen_at = now;
        attachment.source_file_name = source_file_name.map(str::to_string);

        let desired = incoming_signatures(&info.crypto_signs);
        let mut kept: HashSet<(String, String)> = HashSet::new();
        let mut delete_signatures = Vec::new();
        for signature in &existing.signatures {
            let key = (
                signature.signature_type.clone(),
                signature.signature_value.clone(),
            );
            if desired.contains(&key) && kept.insert(key) {
                continue;
            }
            delete_signatures.push(signature.id);
        }
        let insert_signatures = desired
            .into_iter()
            .filter(|key| !kept.contains(key))
            .map(|key| new_signature(attachment.id, key))
            .collect();

        changes.update.push(AttachmentUpdate {
            attachment,
            insert_signatures,
            delete_signatures,
        });
    }

    for (key, info) in wanted {
        if matched.contains(&key) {
            continue;
        }
        let id = Uuid::new_v4();
        let mut attachment = NoticeAttachment {
            id,
            notice_version_id: version_id,
            published_content_id: key,
            file_name: None,
            file_size: None,
            description: None,
            document_date: None,
            document_kind_code: None,
            document_kind_name: None,
            url: None,
            inserted_at: now,
            last_seen_at: now,
            source_file_name: source_file_name.map(str::to_string),
        };
        apply_info(&mut attachment, info);
        let signatures = incoming_signatures(&info.crypto_signs)
            .into_iter()
            .map(|key| new_signature(id, key))
            .collect();
        changes.insert.push(StoredAttachment {
            attachment,
            signatures,
        });
    }

    changes
}
