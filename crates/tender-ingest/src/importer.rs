//! Folder importer: hands every notification file below a directory to the
//! ingestor.
//!
//! Files are visited in lexicographic (case-insensitive) path order. A file
//! whose SHA-256 was already seen in this run, or is stored on some version,
//! is counted as a duplicate and skipped. Failures on one file are logged and
//! counted; the run continues with the next file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use tender_core::defaults::{FILE_NAME_DELIMITER, PERIOD_FORMAT, UNKNOWN_LABEL, UNKNOWN_REGION};
use tender_core::{DocumentMetadata, Error, NoticeDocument, NoticeRepository, Result};

use crate::ingestor::{IngestOutcome, NoticeIngestor};

/// Counters for one folder import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub files: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: bool,
}

/// Lowercase hex SHA-256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Metadata from the file name convention `<prefix>_<documentType>_<yyyy-MM-dd>_...`.
///
/// Names with fewer than three segments get the unknown document type and
/// `today` as period. Region is never encoded in the name.
pub fn document_metadata(root: &Path, file: &Path, source: &str, today: NaiveDate) -> DocumentMetadata {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let entry_name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parts: Vec<&str> = stem
        .split(FILE_NAME_DELIMITER)
        .filter(|p| !p.is_empty())
        .collect();

    let (document_type, period) = if parts.len() >= 3 {
        (
            parts[1].to_string(),
            NaiveDate::parse_from_str(parts[2], PERIOD_FORMAT).unwrap_or(today),
        )
    } else {
        (UNKNOWN_LABEL.to_string(), today)
    };

    DocumentMetadata {
        source: source.to_string(),
        document_type,
        region: UNKNOWN_REGION,
        period,
        entry_name,
    }
}

/// Files under `root` with `extension` (case-insensitive), sorted.
pub fn collect_files(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let matches = entry
                    .path()
                    .extension()
                    .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(extension));
                if matches {
                    files.push(entry.into_path());
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    subsystem = "ingest",
                    component = "folder_importer",
                    error = %e,
                    "Error accessing entry"
                );
            }
        }
    }
    files.sort_by_cached_key(|p| p.to_string_lossy().to_lowercase());
    files
}

pub struct FolderImporter {
    notices: Arc<dyn NoticeRepository>,
    ingestor: Arc<NoticeIngestor>,
    extension: String,
    source: String,
}

impl FolderImporter {
    pub fn new(notices: Arc<dyn NoticeRepository>, ingestor: Arc<NoticeIngestor>) -> Self {
        let extension = ingestor.file_extension().to_string();
        Self {
            notices,
            ingestor,
            extension,
            source: tender_core::defaults::IMPORT_SOURCE.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Import every matching file under `root`. Cancellation is checked
    /// between files.
    pub async fn import(&self, root: &Path, cancel: &CancellationToken) -> Result<ImportSummary> {
        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "import directory '{}' does not exist",
                root.display()
            )));
        }
        let start = Instant::now();

        let walk_root = root.to_path_buf();
        let extension = self.extension.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&walk_root, &extension))
            .await
            .map_err(|e| Error::Internal(format!("directory walk failed: {}", e)))?;

        let mut summary = ImportSummary {
            files: files.len(),
            ..Default::default()
        };
        if files.is_empty() {
            info!(
                subsystem = "ingest",
                component = "folder_importer",
                directory = %root.display(),
                "No notification files found"
            );
            return Ok(summary);
        }

        let today = Utc::now().date_naive();
        let mut seen: HashSet<String> = HashSet::new();

        for file in &files {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.import_file(root, file, today, &mut seen, &mut summary)
                .await;
        }

        info!(
            subsystem = "ingest",
            component = "folder_importer",
            directory = %root.display(),
            files = summary.files,
            processed = summary.processed,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            errors = summary.errors,
            cancelled = summary.cancelled,
            duration_ms = start.elapsed().as_millis() as u64,
            "Folder import finished"
        );
        Ok(summary)
    }

    async fn import_file(
        &self,
        root: &Path,
        file: &Path,
        today: NaiveDate,
        seen: &mut HashSet<String>,
        summary: &mut ImportSummary,
    ) {
        let content = match tokio::fs::read(file).await {
            Ok(content) => content,
            Err(e) => {
                summary.errors += 1;
                error!(
                    subsystem = "ingest",
                    component = "folder_importer",
                    file = %file.display(),
                    error = %e,
                    "Failed to read file"
                );
                return;
            }
        };

        let hash = content_hash(&content);
        if !seen.insert(hash.clone()) {
            summary.duplicates += 1;
            debug!(
                subsystem = "ingest",
                component = "folder_importer",
                file = %file.display(),
                "Identical file already imported in this run"
            );
            return;
        }

        match self.notices.version_hash_exists(&hash).await {
            Ok(true) => {
                summary.duplicates += 1;
                debug!(
                    subsystem = "ingest",
                    component = "folder_importer",
                    file = %file.display(),
                    "Identical version already stored"
                );
                return;
            }
            Ok(false) => {}
            Err(e) => {
                summary.errors += 1;
                error!(
                    subsystem = "ingest",
                    component = "folder_importer",
                    file = %file.display(),
                    error = %e,
                    "Duplicate check failed"
                );
                return;
            }
        }

        let document = NoticeDocument {
            content,
            hash,
            metadata: document_metadata(root, file, &self.source, today),
            source_file_name: file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        };

        match self.ingestor.process(&document).await {
            Ok(IngestOutcome::Ingested(_)) => summary.processed += 1,
            Ok(IngestOutcome::Unchanged { .. }) => summary.duplicates += 1,
            Ok(IngestOutcome::Skipped(_)) => summary.skipped += 1,
            Err(e) => {
                summary.errors += 1;
                error!(
                    subsystem = "ingest",
                    component = "folder_importer",
                    file = %file.display(),
                    entry = %document.metadata.entry_name,
                    error = %e,
                    "Failed to ingest file"
                );
            }
        }
    }
}
