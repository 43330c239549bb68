//! # tender-jobs
//!
//! Broker-backed background work for the tender pipeline.
//!
//! This crate provides:
//! - [`QueueConsumer`], the shared consume loop (reconnect, poison handling,
//!   back-off) every worker runs on
//! - The analysis workflow: [`AnalysisService`], the pull-based
//!   [`AnalysisWorker`] with its stuck sweep, and an OpenAI-compatible engine
//! - [`AnalysisResultListener`] and the [`NotificationRelay`] to user sessions
//! - Query embeddings ([`QueryVectorService`], [`VectorResultListener`]) and
//!   the [`NoticeVectorizer`] scheduler

pub mod analysis;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod query_vectors;
pub mod relay;
pub mod vectorizer;
pub mod worker;

pub use analysis::{result_message, AnalysisService};
pub use config::{QueryVectorConfig, VectorizerConfig, WorkerConfig};
pub use consumer::{
    sleep_or_cancel, ConsumeMode, ConsumerConfig, ConsumerEvent, ConsumerState, MessageHandler,
    QueueConsumer,
};
pub use engine::{build_prompt, AnalysisEngine, AnalysisEngineConfig, OpenAiAnalysisEngine};
pub use query_vectors::{QueryVectorOutcome, QueryVectorService, VectorResultListener};
pub use relay::{AnalysisResultListener, NotificationRelay};
pub use vectorizer::{NoticeVectorizer, VectorizePass};
pub use worker::AnalysisWorker;
