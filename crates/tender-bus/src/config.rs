//! Event bus configuration.

use std::sync::Arc;
use std::time::Duration;

use tender_core::defaults::{
    ACK_WAIT_MARGIN_SECS, ACK_WAIT_SECS, ANALYSIS_QUEUE_SUFFIX, ANALYSIS_RESULT_QUEUE_SUFFIX,
    DEDUP_TTL_MINUTES, PUBLISH_RETRY_COUNT, PUBLISH_RETRY_DELAY_MS,
};
use tender_core::QueueKind;

use crate::broker::BrokerConnector;
use crate::jetstream::JetStreamConnector;
use crate::memory::MemoryBroker;

const DEFAULT_URL: &str = "nats://localhost:4222";
const MEMORY_SCHEME: &str = "memory://";

/// Broker connection and queue naming.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub enabled: bool,
    /// `nats://host:port` or `memory://`.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Publish attempts before giving up.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub queue_name: Option<String>,
    /// Favorite-search queue; also the stem of the analysis queues.
    pub command_queue_name: Option<String>,
    pub vector_request_queue: Option<String>,
    pub vector_response_queue: Option<String>,
    pub dedup_minutes: u64,
    /// Seconds an unacked delivery stays invisible before redelivery.
    pub ack_wait_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: DEFAULT_URL.to_string(),
            user: None,
            password: None,
            retry_count: PUBLISH_RETRY_COUNT,
            retry_delay_ms: PUBLISH_RETRY_DELAY_MS,
            queue_name: None,
            command_queue_name: None,
            vector_request_queue: None,
            vector_response_queue: None,
            dedup_minutes: DEDUP_TTL_MINUTES,
            ack_wait_secs: ACK_WAIT_SECS,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl EventBusConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EVENT_BUS_ENABLED` | `false` | Enable broker-backed task queues |
    /// | `EVENT_BUS_URL` | `nats://localhost:4222` | Broker URL, or `memory://` |
    /// | `EVENT_BUS_USER` | - | Broker user |
    /// | `EVENT_BUS_PASSWORD` | - | Broker password |
    /// | `EVENT_BUS_RETRY_COUNT` | `5` | Publish attempts |
    /// | `EVENT_BUS_RETRY_DELAY_MS` | `2000` | Delay between publish attempts |
    /// | `EVENT_BUS_QUEUE_NAME` | - | Default queue name |
    /// | `EVENT_BUS_COMMAND_QUEUE_NAME` | queue name | Favorite-search and analysis stem |
    /// | `EVENT_BUS_VECTOR_REQUEST_QUEUE` | command queue | Embedding requests |
    /// | `EVENT_BUS_VECTOR_RESPONSE_QUEUE` | - | Embedding results |
    /// | `EVENT_BUS_DEDUP_MINUTES` | `30` | In-flight dedup window |
    /// | `EVENT_BUS_ACK_WAIT_SECS` | `300` | Redelivery delay for unacked messages |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let enabled = lookup("EVENT_BUS_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.enabled);

        let retry_count = lookup("EVENT_BUS_RETRY_COUNT")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.retry_count)
            .max(1);

        let retry_delay_ms = lookup("EVENT_BUS_RETRY_DELAY_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.retry_delay_ms);

        let dedup_minutes = lookup("EVENT_BUS_DEDUP_MINUTES")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.dedup_minutes);

        let ack_wait_secs = lookup("EVENT_BUS_ACK_WAIT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.ack_wait_secs);

        Self {
            enabled,
            url: non_empty(lookup("EVENT_BUS_URL")).unwrap_or(defaults.url),
            user: non_empty(lookup("EVENT_BUS_USER")),
            password: non_empty(lookup("EVENT_BUS_PASSWORD")),
            retry_count,
            retry_delay_ms,
            queue_name: non_empty(lookup("EVENT_BUS_QUEUE_NAME")),
            command_queue_name: non_empty(lookup("EVENT_BUS_COMMAND_QUEUE_NAME")),
            vector_request_queue: non_empty(lookup("EVENT_BUS_VECTOR_REQUEST_QUEUE")),
            vector_response_queue: non_empty(lookup("EVENT_BUS_VECTOR_RESPONSE_QUEUE")),
            dedup_minutes,
            ack_wait_secs,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_command_queue(mut self, name: impl Into<String>) -> Self {
        self.command_queue_name = Some(name.into());
        self
    }

    pub fn with_vector_queues(
        mut self,
        request: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.vector_request_queue = Some(request.into());
        self.vector_response_queue = Some(response.into());
        self
    }

    pub fn with_retry(mut self, count: u32, delay_ms: u64) -> Self {
        self.retry_count = count.max(1);
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Raise the ack wait so a handler running for up to `handler_timeout`
    /// is not redelivered to another worker while it is still running.
    pub fn with_min_ack_wait(mut self, handler_timeout: Duration) -> Self {
        let required = handler_timeout.as_secs() + ACK_WAIT_MARGIN_SECS;
        self.ack_wait_secs = self.ack_wait_secs.max(required);
        self
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_minutes * 60)
    }

    /// Resolve queue names. Everything is unset while the bus is disabled.
    pub fn queues(&self) -> QueueNames {
        if !self.enabled {
            return QueueNames::default();
        }
        let command = self
            .command_queue_name
            .clone()
            .or_else(|| self.queue_name.clone());
        QueueNames {
            analysis_request: command
                .as_ref()
                .map(|c| format!("{}{}", c, ANALYSIS_QUEUE_SUFFIX)),
            analysis_result: command
                .as_ref()
                .map(|c| format!("{}{}", c, ANALYSIS_RESULT_QUEUE_SUFFIX)),
            vector_request: self
                .vector_request_queue
                .clone()
                .or_else(|| command.clone()),
            vector_result: self.vector_response_queue.clone(),
            favorite_search: command,
        }
    }

    /// Connector for the configured URL. A `memory://` URL yields a fresh
    /// in-process broker; share the returned handle between producers and
    /// consumers.
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        if self.url.starts_with(MEMORY_SCHEME) {
            return Arc::new(MemoryBroker::new());
        }
        let mut connector =
            JetStreamConnector::new(self.url.clone()).with_ack_wait(self.ack_wait());
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            connector = connector.with_credentials(user.clone(), password.clone());
        }
        Arc::new(connector)
    }
}

/// Concrete queue names per [`QueueKind`]. `None` disables that path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNames {
    pub favorite_search: Option<String>,
    pub analysis_request: Option<String>,
    pub analysis_result: Option<String>,
    pub vector_request: Option<String>,
    pub vector_result: Option<String>,
}

impl QueueNames {
    pub fn get(&self, kind: QueueKind) -> Option<&str> {
        match kind {
            QueueKind::FavoriteSearch => self.favorite_search.as_deref(),
            QueueKind::AnalysisRequest => self.analysis_request.as_deref(),
            QueueKind::AnalysisResult => self.analysis_result.as_deref(),
            QueueKind::VectorRequest => self.vector_request.as_deref(),
            QueueKind::VectorResult => self.vector_result.as_deref(),
        }
    }

    /// Every configured name, deduplicated, in [`QueueKind::ALL`] order.
    pub fn declared(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for kind in QueueKind::ALL {
            if let Some(name) = self.get(kind) {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }
}
