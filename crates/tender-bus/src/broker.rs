//! Broker abstraction: durable named queues with publish, pull, push, and
//! manual acknowledgement.
//!
//! A [`BrokerConnector`] opens a fresh [`BrokerChannel`] on every call. The
//! channel is owned by exactly one task (a worker or the dispatcher); when it
//! faults, the owner closes it with [`close_best_effort`] and asks the
//! connector for a new one. Nothing shares a channel across tasks.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tender_core::Result;

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// A received message awaiting acknowledgement.
///
/// Dropping a delivery without acking leaves it unacknowledged; the broker
/// redelivers it once the channel goes away.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Push subscription: yields deliveries until the channel faults or closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// An open connection/channel to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// False once the channel has closed or its connection dropped.
    fn is_open(&self) -> bool;

    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Publish a persistent message to `queue`.
    async fn publish(&self, queue: &str, message: &OutgoingMessage) -> Result<()>;

    /// Pull one message without auto-ack. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Push subscription with manual ack.
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream>;

    /// Drop every ready message in `queue`, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

/// Opens broker channels.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Human-readable target for logs (never includes credentials).
    fn describe(&self) -> String;
}

/// Sleep for `duration` unless `cancel` fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Close a channel, logging instead of propagating any failure.
pub async fn close_best_effort(channel: Box<dyn BrokerChannel>, component: &str) {
    if let Err(e) = channel.close().await {
        warn!(
            subsystem = "bus",
            component,
            op = "close",
            error = %e,
            "Failed to close broker channel"
        );
    }
}
