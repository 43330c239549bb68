//! Vectorization scheduler.
//!
//! Each pass walks every notice without an embedding in id order (keyset
//! pagination) and publishes one [`VectorBatchRequest`] per page. Results
//! come back through the vector result listener. Passes repeat after the
//! idle delay until cancelled.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tender_bus::TaskDispatcher;
use tender_core::{NoticeRepository, QueueKind, Result, VectorBatchRequest, VectorItem};

use crate::config::VectorizerConfig;
use crate::consumer::sleep_or_cancel;

/// Outcome of one pass over the notices table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorizePass {
    pub batches: usize,
    pub notices: usize,
}

pub struct NoticeVectorizer {
    notices: Arc<dyn NoticeRepository>,
    dispatcher: Arc<TaskDispatcher>,
    config: VectorizerConfig,
}

impl NoticeVectorizer {
    pub fn new(
        notices: Arc<dyn NoticeRepository>,
        dispatcher: Arc<TaskDispatcher>,
        config: VectorizerConfig,
    ) -> Self {
        Self {
            notices,
            dispatcher,
            config,
        }
    }

    /// Run passes until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!(
                subsystem = "jobs",
                component = "vectorizer",
                "Notice vectorizer is disabled"
            );
            return;
        }
        if !self.dispatcher.is_enabled(QueueKind::VectorRequest) {
            warn!(
                subsystem = "jobs",
                component = "vectorizer",
                "Vector request queue is not configured, vectorizer not started"
            );
            return;
        }

        if self.config.purge_on_start {
            self.purge_queues().await;
        }

        loop {
            match self.run_pass(&cancel).await {
                Ok(pass) => info!(
                    subsystem = "jobs",
                    component = "vectorizer",
                    batches = pass.batches,
                    notices = pass.notices,
                    "Vectorization pass finished"
                ),
                Err(e) => error!(
                    subsystem = "jobs",
                    component = "vectorizer",
                    error = %e,
                    "Vectorization pass failed"
                ),
            }
            if !sleep_or_cancel(self.config.idle_delay(), &cancel).await {
                break;
            }
        }
        info!(subsystem = "jobs", component = "vectorizer", "Notice vectorizer stopped");
    }

    async fn purge_queues(&self) {
        for kind in [QueueKind::VectorRequest, QueueKind::VectorResult] {
            if !self.dispatcher.is_enabled(kind) {
                continue;
            }
            match self.dispatcher.purge(kind).await {
                Ok(purged) => info!(
                    subsystem = "jobs",
                    component = "vectorizer",
                    op = "purge",
                    queue = kind.as_str(),
                    purged,
                    "Vector queue purged"
                ),
                Err(e) => warn!(
                    subsystem = "jobs",
                    component = "vectorizer",
                    op = "purge",
                    queue = kind.as_str(),
                    error = %e,
                    "Failed to purge vector queue"
                ),
            }
        }
    }

    /// Publish one batch per page of notices missing an embedding.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<VectorizePass> {
        let start = Instant::now();
        let mut pass = VectorizePass::default();
        let mut after = None;

        while !cancel.is_cancelled() {
            let page = self
                .notices
                .missing_vectors(after, self.config.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            let items: Vec<VectorItem> = page
                .into_iter()
                .map(|candidate| VectorItem {
                    id: candidate.id,
                    user_id: String::new(),
                    string: candidate.text,
                })
                .collect();
            let count = items.len();
            self.dispatcher
                .publish_vector_batch(VectorBatchRequest {
                    service_id: self.config.service_id.clone(),
                    items,
                })
                .await?;

            pass.batches += 1;
            pass.notices += count;
            info!(
                subsystem = "jobs",
                component = "vectorizer",
                page = pass.batches,
                batch_size = count,
                service_id = %self.config.service_id,
                duration_ms = start.elapsed().as_millis() as u64,
                "Queued notices for vectorization"
            );
        }
        Ok(pass)
    }
}
