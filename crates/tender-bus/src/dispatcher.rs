//! Task dispatcher: publishes typed task messages to their durable queues.
//!
//! The dispatcher owns one broker channel, opened lazily on the first publish
//! and reused while it stays open. Every configured queue is declared each
//! time a channel is opened. A failed connect or publish closes the channel
//! and retries on a fresh one, up to the configured attempt count, then
//! returns [`Error::Broker`] to the caller.
//!
//! The channel lock is held for one connect-and-publish attempt at a time,
//! never across the back-off. Once the dispatcher's cancellation token fires,
//! pending attempts and back-offs stop and the publish fails with
//! [`Error::Unavailable`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tender_core::defaults::DEDUP_HEADER;
use tender_core::{
    AnalysisRequest, AnalysisResult, Error, FavoriteSearchCommand, QueueKind, Result, TaskMessage,
    VectorBatchRequest,
};

use crate::broker::{close_best_effort, sleep_or_cancel, BrokerChannel, BrokerConnector, OutgoingMessage};
use crate::config::{EventBusConfig, QueueNames};

pub struct TaskDispatcher {
    connector: Arc<dyn BrokerConnector>,
    queues: QueueNames,
    retry_count: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
    channel: Mutex<Option<Box<dyn BrokerChannel>>>,
}

impl TaskDispatcher {
    pub fn new(connector: Arc<dyn BrokerConnector>, queues: QueueNames) -> Self {
        let defaults = EventBusConfig::default();
        Self {
            connector,
            queues,
            retry_count: defaults.retry_count,
            retry_delay: defaults.retry_delay(),
            cancel: CancellationToken::new(),
            channel: Mutex::new(None),
        }
    }

    pub fn from_config(connector: Arc<dyn BrokerConnector>, config: &EventBusConfig) -> Self {
        Self::new(connector, config.queues()).with_retry(config.retry_count, config.retry_delay())
    }

    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count.max(1);
        self.retry_delay = delay;
        self
    }

    /// Stop retrying once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    /// Whether a queue is configured for `kind`.
    pub fn is_enabled(&self, kind: QueueKind) -> bool {
        self.queues.get(kind).is_some()
    }

    fn queue_for(&self, kind: QueueKind) -> Result<&str> {
        self.queues
            .get(kind)
            .ok_or_else(|| Error::Unavailable(format!("{} queue is not configured", kind.as_str())))
    }

    /// Publish to the queue bound to the message's kind.
    pub async fn publish(&self, message: &TaskMessage) -> Result<()> {
        let kind = message.queue();
        let queue = self.queue_for(kind)?;
        let mut outgoing = OutgoingMessage::new(message.to_json()?);
        if let TaskMessage::FavoriteSearch(command) = message {
            outgoing = outgoing.with_header(DEDUP_HEADER, command.dedup_key());
        }
        self.publish_raw(queue, &outgoing).await?;
        debug!(
            subsystem = "bus",
            component = "dispatcher",
            op = "publish",
            kind = kind.as_str(),
            queue,
            "Task published"
        );
        Ok(())
    }

    pub async fn publish_favorite_search(&self, command: FavoriteSearchCommand) -> Result<()> {
        self.publish(&TaskMessage::FavoriteSearch(command)).await
    }

    pub async fn publish_vector_batch(&self, request: VectorBatchRequest) -> Result<()> {
        self.publish(&TaskMessage::VectorRequest(request)).await
    }

    pub async fn publish_analysis_request(&self, request: AnalysisRequest) -> Result<()> {
        self.publish(&TaskMessage::AnalysisRequest(request)).await
    }

    /// Publish an analysis result. Skipped with a warning when no result
    /// queue is configured, since nobody would consume it.
    pub async fn publish_analysis_result(&self, result: AnalysisResult) -> Result<()> {
        if !self.is_enabled(QueueKind::AnalysisResult) {
            warn!(
                subsystem = "bus",
                component = "dispatcher",
                analysis_id = ?result.analysis_id,
                "Analysis result queue not configured, result dropped"
            );
            return Ok(());
        }
        self.publish(&TaskMessage::AnalysisResult(result)).await
    }

    /// Drop every ready message on the queue bound to `kind`.
    pub async fn purge(&self, kind: QueueKind) -> Result<u64> {
        let queue = self.queue_for(kind)?.to_string();
        let mut slot = self.channel.lock().await;
        let channel = self.ensure_channel(&mut slot).await?;
        match channel.purge(&queue).await {
            Ok(purged) => Ok(purged),
            Err(e) => {
                if let Some(stale) = slot.take() {
                    close_best_effort(stale, "dispatcher").await;
                }
                Err(e)
            }
        }
    }

    async fn ensure_channel<'a>(
        &self,
        slot: &'a mut Option<Box<dyn BrokerChannel>>,
    ) -> Result<&'a dyn BrokerChannel> {
        if slot.as_ref().is_some_and(|c| !c.is_open()) {
            if let Some(stale) = slot.take() {
                close_best_effort(stale, "dispatcher").await;
            }
        }
        if slot.is_none() {
            let channel = self.connector.connect().await?;
            for queue in self.queues.declared() {
                if let Err(e) = channel.declare_queue(&queue).await {
                    close_best_effort(channel, "dispatcher").await;
                    return Err(e);
                }
            }
            info!(
                subsystem = "bus",
                component = "dispatcher",
                op = "connect",
                target = %self.connector.describe(),
                "Broker channel opened"
            );
            *slot = Some(channel);
        }
        slot.as_deref()
            .ok_or_else(|| Error::Internal("broker channel missing after connect".to_string()))
    }

    /// One connect-and-publish under the channel lock. A failure closes the
    /// channel so the next attempt starts fresh.
    async fn attempt(&self, queue: &str, message: &OutgoingMessage) -> Result<()> {
        let mut slot = self.channel.lock().await;
        let outcome = match self.ensure_channel(&mut slot).await {
            Ok(channel) => channel.publish(queue, message).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            if let Some(stale) = slot.take() {
                close_best_effort(stale, "dispatcher").await;
            }
        }
        outcome
    }

    fn cancelled(&self, queue: &str) -> Error {
        Error::Unavailable(format!("publish to '{}' cancelled", queue))
    }

    async fn publish_raw(&self, queue: &str, message: &OutgoingMessage) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.retry_count {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(queue)),
                outcome = self.attempt(queue, message) => outcome,
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        subsystem = "bus",
                        component = "dispatcher",
                        op = "publish",
                        queue,
                        attempt,
                        max_attempts = self.retry_count,
                        error = %e,
                        "Publish failed"
                    );
                    last_error = Some(e);
                    if attempt < self.retry_count
                        && !sleep_or_cancel(self.retry_delay, &self.cancel).await
                    {
                        return Err(self.cancelled(queue));
                    }
                }
            }
        }

        Err(Error::Broker(format!(
            "publish to '{}' failed after {} attempts: {}",
            queue,
            self.retry_count,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Close the current channel, if any.
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            close_best_effort(channel, "dispatcher").await;
        }
    }
}
