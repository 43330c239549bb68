//! User query embeddings and the vector result listener.
//!
//! `enqueue_vector_batch` stores a pending record, publishes a one-item batch
//! to the embedding service, and waits a short while for the answer. Results
//! arrive on the vector response queue; the listener completes the waiting
//! caller, if it is still waiting, and tells the user's sessions either way.
//! Results with an empty user id are notice embeddings and go straight to
//! the notice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tender_bus::{BrokerConnector, TaskDispatcher};
use tender_core::{
    EnqueueErrorKind, EnqueueOutcome, Error, NoticeRepository, QueryVectorRepository, QueueKind,
    Result, UserEvent, UserNotifier, UserQueryVector, VectorBatchRequest, VectorItem, VectorResult,
};

use crate::config::{QueryVectorConfig, WorkerConfig};
use crate::consumer::{MessageHandler, QueueConsumer};

/// Answer to a query-vector request.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryVectorOutcome {
    /// The vector arrived within the wait window.
    Ready(UserQueryVector),
    /// Still being computed; the record with this id completes later.
    Pending(Uuid),
}

type Waiters = Arc<Mutex<HashMap<Uuid, oneshot::Sender<UserQueryVector>>>>;

pub struct QueryVectorService {
    vectors: Arc<dyn QueryVectorRepository>,
    dispatcher: Arc<TaskDispatcher>,
    config: QueryVectorConfig,
    waiters: Waiters,
}

impl QueryVectorService {
    pub fn new(
        vectors: Arc<dyn QueryVectorRepository>,
        dispatcher: Arc<TaskDispatcher>,
        config: QueryVectorConfig,
    ) -> Self {
        Self {
            vectors,
            dispatcher,
            config,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn take_waiter(&self, id: Uuid) -> Option<oneshot::Sender<UserQueryVector>> {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Callers currently waiting for a vector.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Request the embedding of `query` for `user_id`.
    ///
    /// Blank input and a disabled queue are rejected in the outcome. Once
    /// published, the outcome carries the vector or its pending id.
    pub async fn enqueue_vector_batch(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<EnqueueOutcome<QueryVectorOutcome>> {
        let user_id = user_id.trim();
        let query = query.trim();
        if user_id.is_empty() {
            return Ok(EnqueueOutcome::rejected(
                EnqueueErrorKind::Invalid,
                "user id is required",
            ));
        }
        if query.is_empty() {
            return Ok(EnqueueOutcome::rejected(
                EnqueueErrorKind::Invalid,
                "query is required",
            ));
        }
        if !self.dispatcher.is_enabled(QueueKind::VectorRequest) {
            return Ok(EnqueueOutcome::rejected(
                EnqueueErrorKind::Disabled,
                "vector request queue is not configured",
            ));
        }

        let now = Utc::now();
        let record = UserQueryVector {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            vector: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.vectors.upsert(&record).await?;

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id, tx);

        let batch = VectorBatchRequest {
            service_id: self.config.service_id.clone(),
            items: vec![VectorItem {
                id: record.id,
                user_id: record.user_id.clone(),
                string: record.query.clone(),
            }],
        };
        if let Err(e) = self.dispatcher.publish_vector_batch(batch).await {
            self.take_waiter(record.id);
            return Err(e);
        }
        debug!(
            subsystem = "jobs",
            component = "query_vectors",
            op = "enqueue",
            query_vector_id = %record.id,
            user_id,
            "Query vector requested"
        );

        let answer = match tokio::time::timeout(self.config.wait(), rx).await {
            Ok(Ok(completed)) => QueryVectorOutcome::Ready(completed),
            Ok(Err(_)) => QueryVectorOutcome::Pending(record.id),
            Err(_) => {
                self.take_waiter(record.id);
                QueryVectorOutcome::Pending(record.id)
            }
        };
        Ok(EnqueueOutcome::enqueued(answer))
    }

    /// Store a query embedding and wake its waiting caller.
    pub async fn apply_result(&self, result: &VectorResult) -> Result<UserQueryVector> {
        let vector = match &result.vector {
            Some(vector) if !vector.is_empty() => vector.clone(),
            _ => {
                self.take_waiter(result.id);
                return Err(Error::InvalidInput(format!(
                    "vector result {} is empty",
                    result.id
                )));
            }
        };

        let now = Utc::now();
        let mut record = match self.vectors.get(result.id).await? {
            Some(record) => record,
            None => {
                let user_id = result.user_id.as_deref().map(str::trim).unwrap_or("");
                let query = result.query.as_deref().map(str::trim).unwrap_or("");
                if user_id.is_empty() || query.is_empty() {
                    self.take_waiter(result.id);
                    return Err(Error::InvalidInput(format!(
                        "cannot determine user or query for vector {}",
                        result.id
                    )));
                }
                UserQueryVector {
                    id: result.id,
                    user_id: user_id.to_string(),
                    query: query.to_string(),
                    vector: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                }
            }
        };
        record.vector = Some(vector);
        record.updated_at = now;
        record.completed_at = Some(now);
        self.vectors.upsert(&record).await?;

        if let Some(waiter) = self.take_waiter(record.id) {
            // The caller may have stopped waiting in the meantime.
            let _ = waiter.send(record.clone());
        }
        Ok(record)
    }
}

/// Push consumer of the vector response queue.
pub struct VectorResultListener {
    notices: Arc<dyn NoticeRepository>,
    queries: Arc<QueryVectorService>,
    notifier: Arc<dyn UserNotifier>,
}

impl VectorResultListener {
    pub fn new(
        notices: Arc<dyn NoticeRepository>,
        queries: Arc<QueryVectorService>,
        notifier: Arc<dyn UserNotifier>,
    ) -> Self {
        Self {
            notices,
            queries,
            notifier,
        }
    }

    pub fn consumer(
        self,
        connector: Arc<dyn BrokerConnector>,
        queue: impl Into<String>,
        config: &WorkerConfig,
    ) -> QueueConsumer<Self> {
        QueueConsumer::new(connector, queue, Arc::new(self), config.push())
    }
}

#[async_trait]
impl MessageHandler for VectorResultListener {
    type Message = VectorResult;

    fn component(&self) -> &'static str {
        "vector_result_listener"
    }

    async fn handle(&self, result: VectorResult) -> Result<()> {
        if result.vector.as_ref().map_or(true, |v| v.is_empty()) {
            warn!(
                subsystem = "jobs",
                component = "vector_result_listener",
                id = %result.id,
                "Vector result without a vector, discarded"
            );
            return Ok(());
        }

        if result.is_notice_embedding() {
            let vector = result.vector.unwrap_or_default();
            let stored = self.notices.set_vector(result.id, vector).await?;
            if stored {
                debug!(
                    subsystem = "jobs",
                    component = "vector_result_listener",
                    notice_id = %result.id,
                    "Notice embedding stored"
                );
            } else {
                warn!(
                    subsystem = "jobs",
                    component = "vector_result_listener",
                    notice_id = %result.id,
                    "Embedding for unknown notice discarded"
                );
            }
            return Ok(());
        }

        let record = self.queries.apply_result(&result).await?;
        let sessions = self.notifier.notify(
            &record.user_id,
            UserEvent::QueryVectorReady {
                query_vector_id: record.id,
            },
        );
        info!(
            subsystem = "jobs",
            component = "vector_result_listener",
            query_vector_id = %record.id,
            user_id = %record.user_id,
            sessions,
            "Query vector ready"
        );
        Ok(())
    }
}
