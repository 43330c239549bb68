//! Analysis workflow over the in-memory broker and store.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tender_bus::{MemoryBroker, TaskDispatcher};
use tender_core::defaults::STUCK_ANALYSIS_ERROR;
use tender_core::{
    decode_payload, AnalysisRepository, AnalysisRequest, AnalysisResult, AnalysisStatus,
    EnqueueErrorKind, Error, Notice, NoticeAnalysis, Result, SessionHub, StoredAttachment, TaskMessage, UserEvent,
};
use tender_db::MemoryDatabase;
use tender_jobs::{
    AnalysisEngine, AnalysisResultListener, AnalysisService, AnalysisWorker, ConsumerEvent,
    NotificationRelay,
};

use common::*;

#[derive(Default)]
struct FakeEngine {
    fail: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl AnalysisEngine for FakeEngine {
    async fn analyze(&self, notice: &Notice, _attachments: &[StoredAttachment]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Request("model overloaded".into()));
        }
        Ok(format!("verdict for {}", notice.external_id))
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

struct Fixture {
    broker: MemoryBroker,
    db: MemoryDatabase,
    engine: Arc<FakeEngine>,
    service: Arc<AnalysisService>,
    notice: Notice,
}

fn fixture_with(dispatcher: Arc<TaskDispatcher>, broker: MemoryBroker) -> Fixture {
    let db = MemoryDatabase::new();
    let notice = notice(Some("Road repair"));
    db.insert_notice(notice.clone());
    let engine = Arc::new(FakeEngine::default());
    let service = Arc::new(AnalysisService::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        engine.clone(),
        dispatcher,
    ));
    Fixture {
        broker,
        db,
        engine,
        service,
        notice,
    }
}

fn fixture() -> Fixture {
    let broker = MemoryBroker::new();
    fixture_with(dispatcher(&broker), broker)
}

fn drain_requests(broker: &MemoryBroker) -> Vec<AnalysisRequest> {
    broker
        .drain(ANALYSIS_QUEUE)
        .iter()
        .map(|m| decode_payload(&m.payload).unwrap())
        .collect()
}

fn drain_results(broker: &MemoryBroker) -> Vec<AnalysisResult> {
    broker
        .drain(RESULT_QUEUE)
        .iter()
        .map(|m| decode_payload(&m.payload).unwrap())
        .collect()
}

fn in_progress(notice_id: Uuid, user_id: &str, age: chrono::Duration) -> NoticeAnalysis {
    let at = Utc::now() - age;
    NoticeAnalysis {
        id: Uuid::new_v4(),
        notice_id,
        user_id: user_id.into(),
        status: AnalysisStatus::InProgress,
        result: None,
        error: None,
        created_at: at,
        updated_at: at,
        completed_at: None,
    }
}

#[tokio::test]
async fn test_enqueue_marks_in_progress_and_publishes() {
    let f = fixture();
    let outcome = f
        .service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    assert!(outcome.enqueued);
    assert!(outcome.error_kind.is_none());
    let view = outcome.value.unwrap();
    assert_eq!(view.status, AnalysisStatus::InProgress);

    let requests = drain_requests(&f.broker);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].notice_id, f.notice.id);
    assert_eq!(requests[0].user_id, "u1");
    assert_eq!(Some(requests[0].analysis_id), view.analysis_id);
    assert!(!requests[0].force);
}

#[tokio::test]
async fn test_enqueue_returns_existing_unless_forced() {
    let f = fixture();
    f.service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    drain_requests(&f.broker);

    let again = f
        .service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    assert!(!again.enqueued);
    assert_eq!(again.error_kind, Some(EnqueueErrorKind::Duplicate));
    let existing = again.value.unwrap();
    assert_eq!(existing.status, AnalysisStatus::InProgress);
    assert!(drain_requests(&f.broker).is_empty());

    let forced = f
        .service
        .enqueue_analysis(f.notice.id, "u1", true)
        .await
        .unwrap();
    assert!(forced.enqueued);
    assert_eq!(forced.value.unwrap().analysis_id, existing.analysis_id);
    let requests = drain_requests(&f.broker);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].force);
}

#[tokio::test]
async fn test_failed_analysis_can_be_requeued() {
    let f = fixture();
    let mut failed = in_progress(f.notice.id, "u1", chrono::Duration::zero());
    failed.status = AnalysisStatus::Failed;
    failed.error = Some("earlier failure".into());
    f.db.put_analysis(failed);

    let outcome = f
        .service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    assert!(outcome.enqueued);
    let view = outcome.value.unwrap();
    assert_eq!(view.status, AnalysisStatus::InProgress);
    assert!(view.error.is_none());
    assert_eq!(drain_requests(&f.broker).len(), 1);
}

#[tokio::test]
async fn test_publish_failure_marks_failed() {
    let f = fixture();
    f.broker.fail_next_publishes(1);

    let err = f
        .service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Broker(_)));

    let stored = f.db.find(f.notice.id, "u1").await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Failed);
    assert!(stored.error.unwrap().contains("failed to queue analysis"));
}

#[tokio::test]
async fn test_enqueue_rejections() {
    let f = fixture();
    let missing = f
        .service
        .enqueue_analysis(Uuid::new_v4(), "u1", false)
        .await
        .unwrap();
    assert!(!missing.enqueued);
    assert_eq!(missing.error_kind, Some(EnqueueErrorKind::Invalid));
    assert!(missing.message.unwrap().contains("not found"));

    let blank = f
        .service
        .enqueue_analysis(f.notice.id, " ", false)
        .await
        .unwrap();
    assert_eq!(blank.error_kind, Some(EnqueueErrorKind::Invalid));
    assert!(blank.value.is_none());
    assert!(drain_requests(&f.broker).is_empty());

    let broker = MemoryBroker::new();
    let disabled = Arc::new(TaskDispatcher::new(
        Arc::new(broker.clone()),
        Default::default(),
    ));
    let f = fixture_with(disabled, broker);
    let disabled = f
        .service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    assert!(!disabled.enqueued);
    assert_eq!(disabled.error_kind, Some(EnqueueErrorKind::Disabled));
    assert!(f.db.find(f.notice.id, "u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_process_request_completes_and_publishes_result() {
    let f = fixture();
    f.service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    let request = drain_requests(&f.broker).remove(0);

    f.service.process_request(&request).await.unwrap();

    let stored = f.db.find(f.notice.id, "u1").await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Completed);
    assert_eq!(
        stored.result.as_deref(),
        Some(format!("verdict for {}", f.notice.external_id).as_str())
    );

    let results = drain_results(&f.broker);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, AnalysisStatus::Completed);
    assert!(results[0].has_result);
}

#[tokio::test]
async fn test_process_request_engine_failure_marks_failed() {
    let f = fixture();
    f.engine.fail.store(true, Ordering::SeqCst);
    f.service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();
    let request = drain_requests(&f.broker).remove(0);

    f.service.process_request(&request).await.unwrap();

    let stored = f.db.find(f.notice.id, "u1").await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Failed);
    assert!(stored.error.unwrap().contains("model overloaded"));
    let results = drain_results(&f.broker);
    assert_eq!(results[0].status, AnalysisStatus::Failed);
}

#[tokio::test]
async fn test_process_request_skips_settled_analysis() {
    let f = fixture();
    let mut done = in_progress(f.notice.id, "u1", chrono::Duration::zero());
    done.status = AnalysisStatus::Completed;
    done.result = Some("kept".into());
    f.db.put_analysis(done.clone());

    let request = AnalysisRequest {
        analysis_id: done.id,
        notice_id: f.notice.id,
        user_id: "u1".into(),
        created_at: Utc::now(),
        force: false,
    };
    f.service.process_request(&request).await.unwrap();

    assert_eq!(f.engine.calls.load(Ordering::SeqCst), 0);
    assert!(drain_results(&f.broker).is_empty());
}

#[tokio::test]
async fn test_reset_stuck_fails_old_rows_and_publishes() {
    let f = fixture();
    let stuck = in_progress(f.notice.id, "u1", chrono::Duration::minutes(45));
    let fresh = in_progress(f.notice.id, "u2", chrono::Duration::minutes(5));
    f.db.put_analysis(stuck.clone());
    f.db.put_analysis(fresh.clone());

    assert_eq!(f.service.reset_stuck().await.unwrap(), 1);

    let stuck_now = f.db.get(stuck.id).await.unwrap().unwrap();
    assert_eq!(stuck_now.status, AnalysisStatus::Failed);
    assert_eq!(stuck_now.error.as_deref(), Some(STUCK_ANALYSIS_ERROR));
    let fresh_now = f.db.get(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh_now.status, AnalysisStatus::InProgress);

    let results = drain_results(&f.broker);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].analysis_id, Some(stuck.id));
    assert_eq!(results[0].status, AnalysisStatus::Failed);

    assert_eq!(f.service.reset_stuck().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_sweeps_when_queue_is_empty() {
    let f = fixture();
    let stuck = in_progress(f.notice.id, "u1", chrono::Duration::hours(2));
    f.db.put_analysis(stuck.clone());

    let consumer = AnalysisWorker::new(f.service.clone()).consumer(
        Arc::new(f.broker.clone()),
        ANALYSIS_QUEUE,
        &worker_config(),
    );
    let mut events = consumer.events();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    // The second idle round starts only after the first sweep returned.
    wait_for(&mut events, |e| *e == ConsumerEvent::Idle).await;
    wait_for(&mut events, |e| *e == ConsumerEvent::Idle).await;

    let stored = f.db.get(stuck.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Failed);
    assert_eq!(drain_results(&f.broker).len(), 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_worker_survives_poison_messages() {
    let f = fixture();
    let pending = in_progress(f.notice.id, "u1", chrono::Duration::zero());
    f.db.put_analysis(pending.clone());

    f.broker.inject(ANALYSIS_QUEUE, b"null".to_vec());
    f.broker.inject(ANALYSIS_QUEUE, b"{not json".to_vec());
    f.broker.inject(ANALYSIS_QUEUE, br#"{"Unrelated":true}"#.to_vec());
    let valid = TaskMessage::AnalysisRequest(AnalysisRequest {
        analysis_id: pending.id,
        notice_id: f.notice.id,
        user_id: "u1".into(),
        created_at: Utc::now(),
        force: false,
    });
    f.broker.inject(ANALYSIS_QUEUE, valid.to_json().unwrap());

    let consumer = AnalysisWorker::new(f.service.clone()).consumer(
        Arc::new(f.broker.clone()),
        ANALYSIS_QUEUE,
        &worker_config(),
    );
    let mut events = consumer.events();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, ConsumerEvent::Poisoned { .. })).await;
    }
    wait_for(&mut events, |e| *e == ConsumerEvent::Handled).await;

    let stored = f.db.get(pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AnalysisStatus::Completed);
    assert_eq!(f.broker.ready_count(ANALYSIS_QUEUE), 0);
    assert_eq!(f.broker.unacked_count(ANALYSIS_QUEUE), 0);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_status_reaches_user_session() {
    let f = fixture();
    let hub = SessionHub::default();
    let mut session = hub.connect("u1");
    let config = worker_config();
    let connector = Arc::new(f.broker.clone());

    let worker =
        AnalysisWorker::new(f.service.clone()).consumer(connector.clone(), ANALYSIS_QUEUE, &config);
    let listener = AnalysisResultListener::new(NotificationRelay::new(
        Arc::new(f.db.clone()),
        Arc::new(hub.clone()),
    ))
    .consumer(connector, RESULT_QUEUE, &config);
    let mut listener_events = listener.events();

    let cancel = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(worker.run(cancel.clone())),
        tokio::spawn(listener.run(cancel.clone())),
    ];

    f.service
        .enqueue_analysis(f.notice.id, "u1", false)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(30), session.recv())
        .await
        .expect("no event pushed")
        .expect("hub closed");
    match event {
        UserEvent::AnalysisUpdated(view) => {
            assert_eq!(view.notice_id, f.notice.id);
            assert_eq!(view.status, AnalysisStatus::Completed);
            assert!(view.has_result);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    wait_for(&mut listener_events, |e| *e == ConsumerEvent::Handled).await;
    assert_eq!(f.broker.unacked_count(RESULT_QUEUE), 0);

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_listener_acks_when_nobody_is_connected() {
    let f = fixture();
    let listener = AnalysisResultListener::new(NotificationRelay::new(
        Arc::new(f.db.clone()),
        Arc::new(SessionHub::default()),
    ))
    .consumer(Arc::new(f.broker.clone()), RESULT_QUEUE, &worker_config());
    let mut events = listener.events();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(listener.run(cancel.clone()));

    let result = TaskMessage::AnalysisResult(AnalysisResult {
        analysis_id: None,
        notice_id: f.notice.id,
        user_id: "offline".into(),
        status: AnalysisStatus::Completed,
        has_result: true,
        error: None,
        updated_at: Utc::now(),
    });
    f.broker.inject(RESULT_QUEUE, result.to_json().unwrap());
    f.broker.inject(RESULT_QUEUE, b"".to_vec());

    wait_for(&mut events, |e| *e == ConsumerEvent::Handled).await;
    wait_for(&mut events, |e| matches!(e, ConsumerEvent::Poisoned { .. })).await;
    assert_eq!(f.broker.ready_count(RESULT_QUEUE), 0);
    assert_eq!(f.broker.unacked_count(RESULT_QUEUE), 0);

    cancel.cancel();
    task.await.unwrap();
}
