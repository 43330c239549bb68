//! Structured logging schema and field name constants.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Handler failure, broker fault, requires operator attention |
//! | WARN  | Recoverable issue: per-file failure, poison message, cleanup failure |
//! | INFO  | Lifecycle events (startup, shutdown, reconnect), import summaries |
//! | DEBUG | Decision points: duplicates, skips, disabled queues |
//! | TRACE | Per-item iteration (per file, per attachment) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "ingest", "bus", "jobs", "db", "host"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "intake_queue", "folder_importer", "dispatcher", "analysis_worker"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "process", "publish", "sweep_stuck"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Notice UUID being operated on.
pub const NOTICE_ID: &str = "notice_id";

/// Stable external id of a notice.
pub const EXTERNAL_ID: &str = "external_id";

/// Notice version number.
pub const VERSION_NUMBER: &str = "version_number";

/// Analysis UUID being processed.
pub const ANALYSIS_ID: &str = "analysis_id";

/// Owning user of a task or session.
pub const USER_ID: &str = "user_id";

/// Broker queue name.
pub const QUEUE: &str = "queue";

/// File path or archive entry being processed.
pub const FILE: &str = "file";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of items in a published batch or scanned page.
pub const BATCH_SIZE: &str = "batch_size";

/// Retry attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
