//! Import pipeline against the in-memory store.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tender_core::{ActivationPolicy, DocumentMetadata, NoticeDocument, NoticeRepository};
use tender_db::MemoryDatabase;
use tender_ingest::{
    content_hash, FolderImporter, ImportQueue, ImportWorker, IngestOutcome, JsonNotificationParser,
    NoticeIngestor, ZipExtractor,
};

const EXTERNAL_ID: &str = "0373100000125000001";

fn notification(version: i32, attachments: &[&str], price: f64) -> Vec<u8> {
    let attachments: Vec<_> = attachments
        .iter()
        .map(|id| {
            json!({
                "publishedContentId": id,
                "fileName": format!("{}.pdf", id),
                "cryptoSigns": [{ "type": "CAdES-BES", "value": format!("sig-{}", id) }]
            })
        })
        .collect();
    serde_json::to_vec(&json!({
        "epNotificationEF2020": {
            "externalId": EXTERNAL_ID,
            "versionNumber": version,
            "commonInfo": {
                "purchaseNumber": EXTERNAL_ID,
                "purchaseObjectInfo": "Road resurfacing"
            },
            "attachmentsInfo": attachments,
            "notificationInfo": {
                "procedureInfo": { "collectingEnd": "2025-03-01T10:00:00Z" },
                "maxPriceInfo": { "maxPrice": price, "currency": "RUB" },
                "customerRequirementsInfo": [
                    { "okpd2": [{ "code": "42.11", "name": "Roads" }], "kvr": [{ "code": "244" }] }
                ]
            }
        }
    }))
    .unwrap()
}

fn document(content: Vec<u8>) -> NoticeDocument {
    NoticeDocument {
        hash: content_hash(&content),
        content,
        metadata: DocumentMetadata {
            source: "test".into(),
            document_type: "epNotificationEF2020".into(),
            region: 0,
            period: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            entry_name: "notice.json".into(),
        },
        source_file_name: Some("notice.json".into()),
    }
}

fn pipeline(db: &MemoryDatabase, policy: ActivationPolicy) -> (Arc<NoticeIngestor>, FolderImporter) {
    let notices: Arc<dyn NoticeRepository> = Arc::new(db.clone());
    let ingestor = Arc::new(
        NoticeIngestor::new(notices.clone(), Arc::new(JsonNotificationParser::new()))
            .with_policy(policy),
    );
    let importer = FolderImporter::new(notices, ingestor.clone());
    (ingestor, importer)
}

fn content_ids(db: &MemoryDatabase) -> Vec<String> {
    db.attachments_of(EXTERNAL_ID)
        .into_iter()
        .map(|a| a.attachment.published_content_id)
        .collect()
}

#[tokio::test]
async fn test_identical_import_is_noop() {
    let db = MemoryDatabase::new();
    let (_, importer) = pipeline(&db, ActivationPolicy::LastIngested);
    let cancel = CancellationToken::new();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), notification(1, &["a"], 100.0)).unwrap();

    let first = importer.import(dir.path(), &cancel).await.unwrap();
    assert_eq!(first.processed, 1);
    let writes = db.writes();

    let second = importer.import(dir.path(), &cancel).await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(db.writes(), writes);
    assert_eq!(db.versions_of(EXTERNAL_ID).len(), 1);
}

#[tokio::test]
async fn test_same_run_duplicates_and_errors_do_not_abort() {
    let db = MemoryDatabase::new();
    let (_, importer) = pipeline(&db, ActivationPolicy::LastIngested);

    let dir = tempfile::tempdir().unwrap();
    let body = notification(1, &["a"], 100.0);
    std::fs::write(dir.path().join("1.json"), b"{ not json").unwrap();
    std::fs::write(dir.path().join("2.json"), &body).unwrap();
    std::fs::write(dir.path().join("3.json"), &body).unwrap();
    std::fs::write(dir.path().join("4.json"), br#"{"epNotificationEF2020":{"id":"x"}}"#).unwrap();
    std::fs::write(dir.path().join("5.json"), notification(2, &["a"], 120.0)).unwrap();

    let summary = importer
        .import(dir.path(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.files, 5);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 2);
    assert!(!summary.cancelled);

    let notice = db.notice_by_external_id(EXTERNAL_ID).unwrap();
    assert_eq!(notice.version_number, 2);
    assert_eq!(notice.max_price, Some(120.0));
    assert_eq!(notice.okpd2_code.as_deref(), Some("42.11"));
    assert_eq!(notice.kvr_code.as_deref(), Some("244"));
    assert!(notice.collecting_end.is_some());
}

#[tokio::test]
async fn test_cancelled_import_stops_between_files() {
    let db = MemoryDatabase::new();
    let (_, importer) = pipeline(&db, ActivationPolicy::LastIngested);
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), notification(1, &[], 1.0)).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = importer.import(dir.path(), &cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.processed, 0);
    assert!(db.versions_of(EXTERNAL_ID).is_empty());
}

#[tokio::test]
async fn test_exactly_one_active_version() {
    let db = MemoryDatabase::new();
    let (ingestor, _) = pipeline(&db, ActivationPolicy::LastIngested);

    for version in [1, 3, 2] {
        ingestor
            .process(&document(notification(version, &["a"], version as f64)))
            .await
            .unwrap();
        let active: Vec<i32> = db
            .versions_of(EXTERNAL_ID)
            .iter()
            .filter(|v| v.is_active)
            .map(|v| v.version_number)
            .collect();
        assert_eq!(active, vec![version]);
    }
    assert_eq!(db.versions_of(EXTERNAL_ID).len(), 3);
}

#[tokio::test]
async fn test_highest_version_policy_keeps_newer_active() {
    let db = MemoryDatabase::new();
    let (ingestor, _) = pipeline(&db, ActivationPolicy::HighestVersion);

    ingestor
        .process(&document(notification(3, &["a"], 300.0)))
        .await
        .unwrap();
    ingestor
        .process(&document(notification(2, &["b"], 200.0)))
        .await
        .unwrap();

    let versions = db.versions_of(EXTERNAL_ID);
    assert_eq!(versions.len(), 2);
    assert!(!versions[0].is_active);
    assert!(versions[1].is_active);
    assert_eq!(
        db.notice_by_external_id(EXTERNAL_ID).unwrap().max_price,
        Some(300.0)
    );
    assert_eq!(content_ids(&db), vec!["a"]);
}

#[tokio::test]
async fn test_attachment_convergence() {
    let db = MemoryDatabase::new();
    let (ingestor, _) = pipeline(&db, ActivationPolicy::LastIngested);

    ingestor
        .process(&document(notification(1, &["a", "b", "c"], 1.0)))
        .await
        .unwrap();
    assert_eq!(content_ids(&db), vec!["a", "b", "c"]);
    assert_eq!(db.signature_count(), 3);

    ingestor
        .process(&document(notification(2, &["a", "b"], 1.0)))
        .await
        .unwrap();
    assert_eq!(content_ids(&db), vec!["a", "b"]);
    assert_eq!(db.signature_count(), 2);

    ingestor
        .process(&document(notification(3, &["a", "b", "c"], 1.0)))
        .await
        .unwrap();
    assert_eq!(content_ids(&db), vec!["a", "b", "c"]);
    assert_eq!(db.signature_count(), 3);
}

#[tokio::test]
async fn test_version_scenario() {
    let db = MemoryDatabase::new();
    let (ingestor, _) = pipeline(&db, ActivationPolicy::LastIngested);

    let v1 = notification(1, &["kept", "dropped"], 10.0);
    let outcome = ingestor.process(&document(v1.clone())).await.unwrap();
    let IngestOutcome::Ingested(first) = outcome else {
        panic!("expected ingestion, got {:?}", outcome);
    };
    let before = db.attachments_of(EXTERNAL_ID);
    let kept_before = before
        .iter()
        .find(|a| a.attachment.published_content_id == "kept")
        .unwrap()
        .clone();

    let writes = db.writes();
    let again = ingestor.process(&document(v1)).await.unwrap();
    assert!(matches!(again, IngestOutcome::Unchanged { version_number: 1, .. }));
    assert_eq!(db.writes(), writes);
    assert!(db.versions_of(EXTERNAL_ID)[0].is_active);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = ingestor
        .process(&document(notification(2, &["kept"], 12.0)))
        .await
        .unwrap();
    let IngestOutcome::Ingested(second) = outcome else {
        panic!("expected ingestion, got {:?}", outcome);
    };
    assert_eq!(second.notice_id, first.notice_id);
    assert!(second.version_created);
    assert_eq!(second.attachments_deleted, 1);
    assert_eq!(second.attachments_updated, 1);

    let versions = db.versions_of(EXTERNAL_ID);
    assert!(!versions[0].is_active);
    assert!(versions[1].is_active);

    let after = db.attachments_of(EXTERNAL_ID);
    assert_eq!(after.len(), 1);
    let kept = &after[0];
    assert_eq!(kept.attachment.id, kept_before.attachment.id);
    assert_eq!(kept.attachment.notice_version_id, second.version_id);
    assert!(kept.attachment.last_seen_at > kept_before.attachment.last_seen_at);
    assert_eq!(kept.signatures, kept_before.signatures);
    assert_eq!(db.signature_count(), 1);

    let window = db.procedure_window(second.version_id).unwrap();
    assert!(window.collecting_end.is_some());
    assert!(db.notice_by_external_id(EXTERNAL_ID).unwrap().updated_at <= Utc::now());
}

#[tokio::test]
async fn test_enqueue_blocks_when_full() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(ImportQueue::new(2, dir.path()).unwrap());
    queue.enqueue(&b"1"[..], Some("1.zip")).await.unwrap();
    queue.enqueue(&b"2"[..], Some("2.zip")).await.unwrap();
    assert_eq!(queue.len(), 2);

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue(&b"3"[..], Some("3.zip")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!producer.is_finished());

    let mut stream = queue.dequeue().unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.original_name, "1.zip");

    tokio::time::timeout(Duration::from_secs(5), producer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let names: Vec<String> = vec![
        stream.next().await.unwrap().original_name,
        stream.next().await.unwrap().original_name,
    ];
    assert_eq!(names, vec!["2.zip", "3.zip"]);
}

fn zip_bytes(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        for (name, body) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).map_or(true, |mut d| d.next().is_none())
}

#[tokio::test]
async fn test_worker_imports_archive_and_cleans_up() {
    let db = MemoryDatabase::new();
    let (_, importer) = pipeline(&db, ActivationPolicy::LastIngested);
    let uploads = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    let queue = ImportQueue::new(4, uploads.path()).unwrap();
    let archive = zip_bytes(&[
        ("folder/notice_ep_2025-01-10_1.json", notification(1, &["a"], 1.0)),
        ("folder/notice_ep_2025-01-11_2.json", notification(2, &["a", "b"], 2.0)),
        ("readme.txt", b"ignored".to_vec()),
    ]);
    queue.enqueue(&archive[..], Some("batch.zip")).await.unwrap();
    queue.enqueue(&b"corrupt"[..], Some("bad.zip")).await.unwrap();

    let worker = ImportWorker::new(
        Arc::new(ZipExtractor::new()),
        Arc::new(importer),
        work.path(),
    );
    let cancel = CancellationToken::new();
    let stream = queue.dequeue().unwrap();
    drop(queue);
    tokio::time::timeout(Duration::from_secs(10), worker.run(stream, cancel))
        .await
        .unwrap();

    let versions = db.versions_of(EXTERNAL_ID);
    assert_eq!(versions.len(), 2);
    assert!(versions[1].is_active);
    let notice = db.notice_by_external_id(EXTERNAL_ID).unwrap();
    assert_eq!(notice.document_type, "ep");
    assert_eq!(notice.period, NaiveDate::from_ymd_opt(2025, 1, 11).unwrap());
    assert_eq!(notice.entry_name, "folder/notice_ep_2025-01-11_2.json");

    assert!(is_empty_dir(uploads.path()));
    assert!(is_empty_dir(work.path()));
}
