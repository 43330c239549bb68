//! Centralized default constants.
//!
//! Every `*Config::default()` in the workspace reads its values from here.
//! Organized by domain area.

// =============================================================================
// IMPORT PIPELINE
// =============================================================================

/// Capacity of the bounded import intake queue. Producers block when full.
pub const IMPORT_QUEUE_CAPACITY: usize = 10;

/// Directory name (under the system temp dir) for staged uploads.
pub const UPLOAD_CACHE_DIR: &str = "tender-upload-cache";

/// Directory name (under the system temp dir) for per-archive extraction.
pub const IMPORT_WORK_DIR: &str = "tender-import";

/// File name used when an upload carries no usable name.
pub const DEFAULT_ARCHIVE_NAME: &str = "archive.zip";

/// Extension of notification files inside an extracted archive.
pub const NOTIFICATION_EXTENSION: &str = "xml";

/// Delimiter between file name segments (`<prefix>_<docType>_<period>_...`).
pub const FILE_NAME_DELIMITER: char = '_';

/// Date format of the period segment in notification file names.
pub const PERIOD_FORMAT: &str = "%Y-%m-%d";

/// Region sentinel used when the region cannot be determined.
pub const UNKNOWN_REGION: i32 = 0;

/// Document type / source label used when it cannot be determined.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Source label for notices imported from uploaded archives.
pub const IMPORT_SOURCE: &str = "archive-import";

// =============================================================================
// EVENT BUS
// =============================================================================

/// Publish attempts before the dispatcher gives up.
pub const PUBLISH_RETRY_COUNT: u32 = 5;

/// Fixed delay between publish attempts.
pub const PUBLISH_RETRY_DELAY_MS: u64 = 2_000;

/// Lifetime of an in-flight dedup marker.
pub const DEDUP_TTL_MINUTES: u64 = 30;

/// How long the broker waits for an ack before redelivering. Must exceed
/// the slowest handler, see [`ANALYSIS_TIMEOUT_SECS`].
pub const ACK_WAIT_SECS: u64 = 300;

/// Headroom added on top of a handler timeout when deriving the ack wait.
pub const ACK_WAIT_MARGIN_SECS: u64 = 30;

/// Suffix of the analysis request queue, appended to the command queue name.
pub const ANALYSIS_QUEUE_SUFFIX: &str = ".analysis";

/// Suffix of the analysis result queue, appended to the command queue name.
pub const ANALYSIS_RESULT_QUEUE_SUFFIX: &str = ".analysis.result";

/// Header carrying the favorite-search dedup key.
pub const DEDUP_HEADER: &str = "x-deduplication-key";

// =============================================================================
// FAVORITE SEARCH
// =============================================================================

/// Default number of top hits requested by a favorite-search run.
pub const FAVORITE_SEARCH_TOP: i32 = 20;

/// Upper bound for `top`.
pub const FAVORITE_SEARCH_TOP_MAX: i32 = 100;

/// Default candidate pool size.
pub const FAVORITE_SEARCH_LIMIT: i32 = 500;

/// `limit` may not exceed `top` times this factor.
pub const FAVORITE_SEARCH_LIMIT_FACTOR: i32 = 50;

/// Default similarity threshold, in percent.
pub const SIMILARITY_THRESHOLD_PERCENT: i32 = 60;

// =============================================================================
// WORKERS
// =============================================================================

/// Delay between pulls when the analysis queue is empty.
pub const IDLE_POLL_DELAY_MS: u64 = 2_000;

/// Back-off after a handler failure.
pub const ERROR_BACKOFF_MS: u64 = 5_000;

/// Reconnect delay for the pull-based analysis worker.
pub const PULL_RECONNECT_DELAY_MS: u64 = 3_000;

/// Reconnect delay for push-based result listeners.
pub const PUSH_RECONNECT_DELAY_MS: u64 = 5_000;

/// Analyses left InProgress for longer than this are reset by the sweep.
pub const STUCK_ANALYSIS_TIMEOUT_MINUTES: i64 = 30;

/// Error text stored on analyses reset by the stuck sweep.
pub const STUCK_ANALYSIS_ERROR: &str = "analysis timed out; retry to run it again";

/// Capacity of the per-consumer event broadcast channel.
pub const CONSUMER_EVENT_CAPACITY: usize = 64;

// =============================================================================
// VECTORS
// =============================================================================

/// Service id sent with user query-vector requests.
pub const QUERY_VECTOR_SERVICE_ID: &str = "AddUserSemanticReq";

/// How long `enqueue_vector_batch` waits for the vector before answering Pending.
pub const QUERY_VECTOR_WAIT_MS: u64 = 3_000;

/// Service id sent with notice embedding batches.
pub const NOTICE_EMBEDDING_SERVICE_ID: &str = "NoticeEmbeddingUpdate";

/// Notices per vectorization batch.
pub const VECTORIZE_BATCH_SIZE: i64 = 100;

/// Sleep between vectorization passes.
pub const VECTORIZE_IDLE_DELAY_SECS: u64 = 30;

// =============================================================================
// PUSH CHANNEL
// =============================================================================

/// Per-user session broadcast buffer.
pub const SESSION_BUFFER: usize = 32;

// =============================================================================
// ANALYSIS ENGINE
// =============================================================================

/// Default chat model for notice analysis.
pub const ANALYSIS_MODEL: &str = "gpt-4o-mini";

/// Request timeout for the analysis engine.
pub const ANALYSIS_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum connections in the pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Minimum idle connections kept open.
pub const DB_MIN_CONNECTIONS: u32 = 1;

/// Connection acquire timeout.
pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Idle connection timeout.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;
