//! # tender-ingest
//!
//! Archive import pipeline for the tender store.
//!
//! This crate provides:
//! - [`ImportQueue`]: bounded, backpressured intake of uploaded archives
//! - [`ImportWorker`]: extracts each archive and imports its files
//! - [`FolderImporter`]: content-hash dedup and metadata from file names
//! - [`NoticeIngestor`]: notice/version upsert with attachment diffing
//! - [`ZipExtractor`] and [`JsonNotificationParser`] collaborators
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tender_ingest::*;
//!
//! let ingestor = Arc::new(NoticeIngestor::new(notices.clone(), Arc::new(JsonNotificationParser)));
//! let importer = Arc::new(FolderImporter::new(notices, ingestor));
//! let queue = ImportQueue::new(config.queue_capacity, &config.upload_cache_dir)?;
//! let worker = ImportWorker::new(Arc::new(ZipExtractor), importer, &config.work_dir);
//! tokio::spawn(worker.run(queue.dequeue()?, cancel.clone()));
//! queue.enqueue(upload, Some("notices.zip")).await?;
//! ```

pub mod config;
pub mod extract;
pub mod importer;
pub mod ingestor;
pub mod parser;
pub mod queue;
pub mod worker;

pub use config::IngestConfig;
pub use extract::ZipExtractor;
pub use importer::{collect_files, content_hash, document_metadata, FolderImporter, ImportSummary};
pub use ingestor::{
    build_plan, diff_attachments, extract_classification, resolve_external_id, Classification,
    IngestOutcome, NoticeIngestor, SkipReason,
};
pub use parser::JsonNotificationParser;
pub use queue::{safe_file_name, ImportQueue, ImportRequest};
pub use worker::ImportWorker;
