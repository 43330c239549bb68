//! NATS JetStream backend.
//!
//! Each queue maps to a work-queue stream whose single subject is the queue
//! name. Consumers are durable pull consumers with explicit ack, shared by
//! every process that consumes the queue, so each message goes to one worker.
//! Push subscriptions are the same consumer drained through its message
//! stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, Context};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use tender_core::defaults::ACK_WAIT_SECS;
use tender_core::{Error, Result};

use crate::broker::{
    Acker, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, OutgoingMessage,
};

fn broker_err(e: impl std::fmt::Display) -> Error {
    Error::Broker(e.to_string())
}

/// Stream names may not contain `.`, `*`, `>` or whitespace.
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' | '\t' => '_',
            other => other,
        })
        .collect::<String>()
        .to_uppercase()
}

fn consumer_name(queue: &str) -> String {
    format!("{}_WORKER", stream_name(queue))
}

/// Durable explicit-ack consumer for `queue`. A delivery left unacked for
/// `ack_wait` goes to another worker.
fn consumer_config(queue: &str, ack_wait: Duration) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(consumer_name(queue)),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        ack_wait,
        ..Default::default()
    }
}

/// Connects to a NATS server with JetStream enabled.
#[derive(Debug, Clone)]
pub struct JetStreamConnector {
    url: String,
    client_name: String,
    credentials: Option<(String, String)>,
    max_messages: i64,
    ack_wait: Duration,
}

impl JetStreamConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: "tender".to_string(),
            credentials: None,
            max_messages: -1,
            ack_wait: Duration::from_secs(ACK_WAIT_SECS),
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    /// Cap on messages retained per queue stream (-1 for unlimited).
    pub fn with_max_messages(mut self, max_messages: i64) -> Self {
        self.max_messages = max_messages;
        self
    }
}

#[async_trait]
impl BrokerConnector for JetStreamConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut options = async_nats::ConnectOptions::new().name(&self.client_name);
        if let Some((user, password)) = &self.credentials {
            options = options.user_and_password(user.clone(), password.clone());
        }
        let client = options.connect(self.url.as_str()).await.map_err(broker_err)?;
        info!(
            subsystem = "bus",
            component = "jetstream",
            op = "connect",
            server = %self.url,
            "Connected to NATS"
        );
        Ok(Box::new(JetStreamChannel {
            context: jetstream::new(client.clone()),
            client,
            consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            max_messages: self.max_messages,
            ack_wait: self.ack_wait,
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct JetStreamChannel {
    client: async_nats::Client,
    context: Context,
    consumers: Mutex<HashMap<String, PullConsumer>>,
    closed: AtomicBool,
    max_messages: i64,
    ack_wait: Duration,
}

impl JetStreamChannel {
    async fn consumer(&self, queue: &str) -> Result<PullConsumer> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(queue) {
            return Ok(consumer.clone());
        }
        let stream = self
            .context
            .get_stream(stream_name(queue))
            .await
            .map_err(broker_err)?;
        let name = consumer_name(queue);
        let consumer: PullConsumer = stream
            .get_or_create_consumer(&name, consumer_config(queue, self.ack_wait))
            .await
            .map_err(broker_err)?;
        debug!(
            subsystem = "bus",
            component = "jetstream",
            queue,
            consumer = %name,
            "Consumer ready"
        );
        consumers.insert(queue.to_string(), consumer.clone());
        Ok(consumer)
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let redelivered = message.info().map(|i| i.delivered > 1).unwrap_or(false);
    let payload = message.payload.to_vec();
    Delivery::new(payload, redelivered, Box::new(JetStreamAcker(message)))
}

#[async_trait]
impl BrokerChannel for JetStreamChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.context
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name(queue),
                subjects: vec![queue.to_string()],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                storage: jetstream::stream::StorageType::File,
                max_messages: self.max_messages,
                ..Default::default()
            })
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutgoingMessage) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        self.context
            .publish_with_headers(queue.to_string(), headers, message.payload.clone().into())
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let consumer = self.consumer(queue).await?;
        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(broker_err)?;
        match batch.next().await {
            Some(Ok(message)) => Ok(Some(into_delivery(message))),
            Some(Err(e)) => Err(broker_err(e)),
            None => Ok(None),
        }
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer = self.consumer(queue).await?;
        let messages = consumer.messages().await.map_err(broker_err)?;
        Ok(messages
            .map(|item| item.map(into_delivery).map_err(broker_err))
            .boxed())
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        let stream = self
            .context
            .get_stream(stream_name(queue))
            .await
            .map_err(broker_err)?;
        let response = stream.purge().await.map_err(broker_err)?;
        Ok(response.purged)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.consumers.lock().await.clear();
        self.client.flush().await.map_err(broker_err)
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0.ack().await.map_err(broker_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_sanitized() {
        assert_eq!(stream_name("favorite-search.analysis"), "FAVORITE-SEARCH_ANALYSIS");
        assert_eq!(stream_name("a.b.c"), "A_B_C");
        assert_eq!(consumer_name("tasks"), "TASKS_WORKER");
    }

    #[test]
    fn test_consumer_config_carries_ack_wait() {
        let config = consumer_config("tasks.analysis", Duration::from_secs(150));
        assert_eq!(config.durable_name.as_deref(), Some("TASKS_ANALYSIS_WORKER"));
        assert_eq!(config.ack_wait, Duration::from_secs(150));
        assert!(matches!(
            config.ack_policy,
            jetstream::consumer::AckPolicy::Explicit
        ));
        assert_eq!(
            JetStreamConnector::new("nats://localhost:4222").ack_wait(),
            Duration::from_secs(ACK_WAIT_SECS)
        );
    }

    #[test]
    fn test_describe_is_url() {
        let connector = JetStreamConnector::new("nats://localhost:4222")
            .with_credentials("user", "secret");
        assert_eq!(connector.describe(), "nats://localhost:4222");
    }
}
