//! Shared consume loop for broker-backed workers.
//!
//! Every worker runs the same state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Consuming -> Processing -> Acked -> Consuming
//! ```
//!
//! Any channel fault (connect, declare, get, subscribe, or ack failure) goes
//! back to `Disconnected`: the channel is closed best-effort and reopened
//! after the reconnect delay, for as long as the cancellation token is not
//! fired.
//!
//! Delivery is at-most-once. A payload that does not decode is acked and
//! discarded. A handler failure is logged, acked, and followed by the error
//! back-off. Cancellation is checked between messages, so a message that is
//! already being handled runs to completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use tender_bus::sleep_or_cancel;
use tender_bus::{close_best_effort, BrokerChannel, BrokerConnector, Delivery};
use tender_core::defaults::CONSUMER_EVENT_CAPACITY;
use tender_core::{decode_payload, Error, Result};

/// Where a consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Processing,
    Acked,
}

/// Emitted by a running consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    StateChanged(ConsumerState),
    /// The handler succeeded and the message was acked.
    Handled,
    /// An unreadable payload was acked and dropped.
    Poisoned { reason: String },
    /// The handler failed; the message was acked anyway.
    HandlerFailed { error: String },
    /// The channel faulted and will be reopened.
    ChannelFault { error: String },
    /// A pull found the queue empty.
    Idle,
}

/// How messages are taken from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Explicit get; an empty queue triggers [`MessageHandler::on_idle`] and the idle delay.
    Pull,
    /// Broker-driven subscription.
    Push,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub mode: ConsumeMode,
    pub idle_delay: Duration,
    pub error_backoff: Duration,
    pub reconnect_delay: Duration,
}

/// Business logic behind a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Contract carried by the queue.
    type Message: DeserializeOwned + Send + 'static;

    /// Component name used in logs.
    fn component(&self) -> &'static str;

    async fn handle(&self, message: Self::Message) -> Result<()>;

    /// Housekeeping run by pull consumers whenever the queue is empty.
    async fn on_idle(&self) -> Result<()> {
        Ok(())
    }
}

enum Disposition {
    Handled,
    Poison(String),
    Failed(Error),
}

/// One queue, one handler, one channel at a time.
pub struct QueueConsumer<H: MessageHandler> {
    connector: Arc<dyn BrokerConnector>,
    queue: String,
    handler: Arc<H>,
    config: ConsumerConfig,
    state: ConsumerState,
    event_tx: broadcast::Sender<ConsumerEvent>,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        queue: impl Into<String>,
        handler: Arc<H>,
        config: ConsumerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(CONSUMER_EVENT_CAPACITY);
        Self {
            connector,
            queue: queue.into(),
            handler,
            config,
            state: ConsumerState::Disconnected,
            event_tx,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Subscribe to lifecycle events. Subscribe before calling [`run`](Self::run).
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: ConsumerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn set_state(&mut self, state: ConsumerState) {
        if self.state != state {
            self.state = state;
            self.emit(ConsumerEvent::StateChanged(state));
        }
    }

    /// Consume until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let component = self.handler.component();
        info!(
            subsystem = "jobs",
            component,
            queue = %self.queue,
            mode = ?self.config.mode,
            broker = %self.connector.describe(),
            "Consumer started"
        );

        while !cancel.is_cancelled() {
            let channel = match self.open_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    self.fault(e);
                    if !sleep_or_cancel(self.config.reconnect_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let fault = match self.config.mode {
                ConsumeMode::Pull => self.pull_until_fault(channel.as_ref(), &cancel).await,
                ConsumeMode::Push => self.push_until_fault(channel.as_ref(), &cancel).await,
            };
            close_best_effort(channel, component).await;
            self.set_state(ConsumerState::Disconnected);

            match fault {
                Some(e) => {
                    self.fault(e);
                    if !sleep_or_cancel(self.config.reconnect_delay, &cancel).await {
                        break;
                    }
                }
                None => break,
            }
        }

        self.set_state(ConsumerState::Disconnected);
        info!(subsystem = "jobs", component, queue = %self.queue, "Consumer stopped");
    }

    fn fault(&mut self, e: Error) {
        warn!(
            subsystem = "jobs",
            component = self.handler.component(),
            queue = %self.queue,
            error = %e,
            retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
            "Broker channel fault, reconnecting"
        );
        self.set_state(ConsumerState::Disconnected);
        self.emit(ConsumerEvent::ChannelFault {
            error: e.to_string(),
        });
    }

    async fn open_channel(&mut self) -> Result<Box<dyn BrokerChannel>> {
        self.set_state(ConsumerState::Connecting);
        let channel = self.connector.connect().await?;
        if let Err(e) = channel.declare_queue(&self.queue).await {
            close_best_effort(channel, self.handler.component()).await;
            return Err(e);
        }
        self.set_state(ConsumerState::Consuming);
        debug!(
            subsystem = "jobs",
            component = self.handler.component(),
            queue = %self.queue,
            "Broker channel open"
        );
        Ok(channel)
    }

    /// Returns the fault that ended the session, or `None` on cancellation.
    async fn pull_until_fault(
        &mut self,
        channel: &dyn BrokerChannel,
        cancel: &CancellationToken,
    ) -> Option<Error> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match channel.get(&self.queue).await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(delivery, cancel).await {
                        return Some(e);
                    }
                }
                Ok(None) => {
                    self.emit(ConsumerEvent::Idle);
                    if let Err(e) = self.handler.on_idle().await {
                        error!(
                            subsystem = "jobs",
                            component = self.handler.component(),
                            op = "on_idle",
                            error = %e,
                            "Idle maintenance failed"
                        );
                    }
                    if !sleep_or_cancel(self.config.idle_delay, cancel).await {
                        return None;
                    }
                }
                Err(e) => return Some(e),
            }
        }
    }

    async fn push_until_fault(
        &mut self,
        channel: &dyn BrokerChannel,
        cancel: &CancellationToken,
    ) -> Option<Error> {
        let mut deliveries = match channel.subscribe(&self.queue).await {
            Ok(stream) => stream,
            Err(e) => return Some(e),
        };
        info!(
            subsystem = "jobs",
            component = self.handler.component(),
            queue = %self.queue,
            "Listening for messages"
        );

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return None,
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.process(delivery, cancel).await {
                        return Some(e);
                    }
                }
                Some(Err(e)) => return Some(e),
                None => return Some(Error::Broker("subscription ended".to_string())),
            }
        }
    }

    /// Handle and ack one delivery. Only an ack failure is returned.
    async fn process(&mut self, delivery: Delivery, cancel: &CancellationToken) -> Result<()> {
        self.set_state(ConsumerState::Processing);
        let component = self.handler.component();

        let disposition = match decode_payload::<H::Message>(&delivery.payload) {
            Err(e) => Disposition::Poison(e.to_string()),
            Ok(message) => match self.handler.handle(message).await {
                Ok(()) => Disposition::Handled,
                Err(e) => Disposition::Failed(e),
            },
        };

        match &disposition {
            Disposition::Handled => {
                debug!(subsystem = "jobs", component, queue = %self.queue, "Message handled");
            }
            Disposition::Poison(reason) => {
                warn!(
                    subsystem = "jobs",
                    component,
                    queue = %self.queue,
                    payload_len = delivery.payload.len(),
                    redelivered = delivery.redelivered,
                    reason = %reason,
                    "Discarding unreadable message"
                );
            }
            Disposition::Failed(e) => {
                error!(
                    subsystem = "jobs",
                    component,
                    queue = %self.queue,
                    error = %e,
                    "Message handler failed"
                );
            }
        }

        delivery.ack().await?;
        self.set_state(ConsumerState::Acked);

        match disposition {
            Disposition::Handled => self.emit(ConsumerEvent::Handled),
            Disposition::Poison(reason) => self.emit(ConsumerEvent::Poisoned { reason }),
            Disposition::Failed(e) => {
                self.emit(ConsumerEvent::HandlerFailed {
                    error: e.to_string(),
                });
                sleep_or_cancel(self.config.error_backoff, cancel).await;
            }
        }

        self.set_state(ConsumerState::Consuming);
        Ok(())
    }
}
