//! Analysis result listener and notification relay.
//!
//! A result message only says "look again": the relay re-reads the stored
//! analysis and pushes that to every session of the owning user. The message
//! is acked whether or not anyone was connected.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tender_bus::BrokerConnector;
use tender_core::{AnalysisRepository, AnalysisResult, AnalysisStatusView, Result, UserEvent, UserNotifier};

use crate::config::WorkerConfig;
use crate::consumer::{MessageHandler, QueueConsumer};

pub struct NotificationRelay {
    analyses: Arc<dyn AnalysisRepository>,
    notifier: Arc<dyn UserNotifier>,
}

impl NotificationRelay {
    pub fn new(analyses: Arc<dyn AnalysisRepository>, notifier: Arc<dyn UserNotifier>) -> Self {
        Self { analyses, notifier }
    }

    /// Push the stored status for `result`'s (notice, user). Returns the
    /// number of sessions reached.
    pub async fn relay(&self, result: &AnalysisResult) -> Result<usize> {
        let view = self
            .analyses
            .find(result.notice_id, &result.user_id)
            .await?
            .map(|a| a.status_view())
            .unwrap_or_else(|| AnalysisStatusView::not_started(result.notice_id, &result.user_id));

        let sessions = self
            .notifier
            .notify(&result.user_id, UserEvent::AnalysisUpdated(view));
        debug!(
            subsystem = "jobs",
            component = "notification_relay",
            notice_id = %result.notice_id,
            user_id = %result.user_id,
            sessions,
            "Analysis status relayed"
        );
        Ok(sessions)
    }
}

/// Push consumer of the analysis result queue.
pub struct AnalysisResultListener {
    relay: NotificationRelay,
}

impl AnalysisResultListener {
    pub fn new(relay: NotificationRelay) -> Self {
        Self { relay }
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
impl MessageHandler for AnalysisResultListener {
    type Message = AnalysisResult;

    fn component(&self) -> &'static str {
        "analysis_result_listener"
    }

    async fn handle(&self, result: AnalysisResult) -> Result<()> {
        self.relay.relay(&result).await.map(|_| ())
    }
}
