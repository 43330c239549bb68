//! Worker, vectorizer, and query-vector configuration.

use std::time::Duration;

use tender_core::defaults::{
    ERROR_BACKOFF_MS, IDLE_POLL_DELAY_MS, NOTICE_EMBEDDING_SERVICE_ID, PULL_RECONNECT_DELAY_MS,
    PUSH_RECONNECT_DELAY_MS, QUERY_VECTOR_SERVICE_ID, QUERY_VECTOR_WAIT_MS,
    STUCK_ANALYSIS_TIMEOUT_MINUTES, VECTORIZE_BATCH_SIZE, VECTORIZE_IDLE_DELAY_SECS,
};

use crate::consumer::{ConsumeMode, ConsumerConfig};

fn parse_flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Timing of the consume loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether the analysis worker and result listeners run at all.
    pub enabled: bool,
    pub idle_poll_delay_ms: u64,
    pub error_backoff_ms: u64,
    pub pull_reconnect_delay_ms: u64,
    pub push_reconnect_delay_ms: u64,
    pub stuck_analysis_timeout_minutes: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_poll_delay_ms: IDLE_POLL_DELAY_MS,
            error_backoff_ms: ERROR_BACKOFF_MS,
            pull_reconnect_delay_ms: PULL_RECONNECT_DELAY_MS,
            push_reconnect_delay_ms: PUSH_RECONNECT_DELAY_MS,
            stuck_analysis_timeout_minutes: STUCK_ANALYSIS_TIMEOUT_MINUTES,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TASK_WORKERS_ENABLED` | `true` | Run the analysis worker and listeners |
    /// | `WORKER_IDLE_POLL_DELAY_MS` | `2000` | Pause when the analysis queue is empty |
    /// | `WORKER_ERROR_BACKOFF_MS` | `5000` | Pause after a handler failure |
    /// | `WORKER_PULL_RECONNECT_DELAY_MS` | `3000` | Reconnect delay of the analysis worker |
    /// | `WORKER_PUSH_RECONNECT_DELAY_MS` | `5000` | Reconnect delay of result listeners |
    /// | `ANALYSIS_STUCK_TIMEOUT_MINUTES` | `30` | Age after which InProgress analyses are reset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let stuck_analysis_timeout_minutes = lookup("ANALYSIS_STUCK_TIMEOUT_MINUTES")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|m| *m > 0)
            .unwrap_or(defaults.stuck_analysis_timeout_minutes);

        Self {
            enabled: parse_flag(lookup("TASK_WORKERS_ENABLED"), defaults.enabled),
            idle_poll_delay_ms: millis("WORKER_IDLE_POLL_DELAY_MS", defaults.idle_poll_delay_ms),
            error_backoff_ms: millis("WORKER_ERROR_BACKOFF_MS", defaults.error_backoff_ms),
            pull_reconnect_delay_ms: millis(
                "WORKER_PULL_RECONNECT_DELAY_MS",
                defaults.pull_reconnect_delay_ms,
            ),
            push_reconnect_delay_ms: millis(
                "WORKER_PUSH_RECONNECT_DELAY_MS",
                defaults.push_reconnect_delay_ms,
            ),
            stuck_analysis_timeout_minutes,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_idle_poll_delay(mut self, ms: u64) -> Self {
        self.idle_poll_delay_ms = ms;
        self
    }

    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    pub fn with_reconnect_delays(mut self, pull_ms: u64, push_ms: u64) -> Self {
        self.pull_reconnect_delay_ms = pull_ms;
        self.push_reconnect_delay_ms = push_ms;
        self
    }

    pub fn with_stuck_timeout(mut self, minutes: i64) -> Self {
        self.stuck_analysis_timeout_minutes = minutes;
        self
    }

    pub fn stuck_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stuck_analysis_timeout_minutes)
    }

    /// Loop settings for a pull consumer.
    pub fn pull(&self) -> ConsumerConfig {
        ConsumerConfig {
            mode: ConsumeMode::Pull,
            idle_delay: Duration::from_millis(self.idle_poll_delay_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            reconnect_delay: Duration::from_millis(self.pull_reconnect_delay_ms),
        }
    }

    /// Loop settings for a push consumer.
    pub fn push(&self) -> ConsumerConfig {
        ConsumerConfig {
            mode: ConsumeMode::Push,
            idle_delay: Duration::from_millis(self.idle_poll_delay_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            reconnect_delay: Duration::from_millis(self.push_reconnect_delay_ms),
        }
    }
}

/// Notice embedding scheduler settings.
#[derive(Debug, Clone)]
pub struct VectorizerConfig {
    pub enabled: bool,
    pub service_id: String,
    pub batch_size: i64,
    pub idle_delay_secs: u64,
    /// Drop whatever is left in the vector queues before the first pass.
    pub purge_on_start: bool,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_id: NOTICE_EMBEDDING_SERVICE_ID.to_string(),
            batch_size: VECTORIZE_BATCH_SIZE,
            idle_delay_secs: VECTORIZE_IDLE_DELAY_SECS,
            purge_on_start: true,
        }
    }
}

impl VectorizerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `NOTICE_EMBEDDING_ENABLED` | `false` | Run the vectorization scheduler |
    /// | `NOTICE_EMBEDDING_SERVICE_ID` | `NoticeEmbeddingUpdate` | Service id sent with each batch |
    /// | `NOTICE_EMBEDDING_BATCH_SIZE` | `100` | Notices per batch |
    /// | `NOTICE_EMBEDDING_IDLE_DELAY_SECS` | `30` | Sleep between passes |
    /// | `NOTICE_EMBEDDING_PURGE_ON_START` | `true` | Purge vector queues before the first pass |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let batch_size = lookup("NOTICE_EMBEDDING_BATCH_SIZE")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(defaults.batch_size)
            .max(1);
        let idle_delay_secs = lookup("NOTICE_EMBEDDING_IDLE_DELAY_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(defaults.idle_delay_secs);

        Self {
            enabled: parse_flag(lookup("NOTICE_EMBEDDING_ENABLED"), defaults.enabled),
            service_id: non_empty(lookup("NOTICE_EMBEDDING_SERVICE_ID"))
                .unwrap_or(defaults.service_id),
            batch_size,
            idle_delay_secs,
            purge_on_start: parse_flag(
                lookup("NOTICE_EMBEDDING_PURGE_ON_START"),
                defaults.purge_on_start,
            ),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_idle_delay(mut self, secs: u64) -> Self {
        self.idle_delay_secs = secs;
        self
    }

    pub fn with_purge_on_start(mut self, purge: bool) -> Self {
        self.purge_on_start = purge;
        self
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }
}

/// User query embedding settings.
#[derive(Debug, Clone)]
pub struct QueryVectorConfig {
    pub service_id: String,
    /// How long a caller waits for the vector before getting `Pending`.
    pub wait_ms: u64,
}

impl Default for QueryVectorConfig {
    fn default() -> Self {
        Self {
            service_id: QUERY_VECTOR_SERVICE_ID.to_string(),
            wait_ms: QUERY_VECTOR_WAIT_MS,
        }
    }
}

impl QueryVectorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUERY_VECTOR_SERVICE_ID` | `AddUserSemanticReq` | Service id sent with each request |
    /// | `QUERY_VECTOR_WAIT_MS` | `3000` | Wait for the vector before answering Pending |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            service_id: non_empty(lookup("QUERY_VECTOR_SERVICE_ID"))
                .unwrap_or(defaults.service_id),
            wait_ms: lookup("QUERY_VECTOR_WAIT_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(defaults.wait_ms),
        }
    }

    pub fn with_wait(mut self, ms: u64) -> Self {
        self.wait_ms = ms;
        self
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}
