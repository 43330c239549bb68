//! Import worker: drains the intake queue one archive at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use tender_core::{ArchiveExtractor, Result};

use crate::importer::{FolderImporter, ImportSummary};
use crate::queue::{remove_staged, ImportRequest};

pub struct ImportWorker {
    extractor: Arc<dyn ArchiveExtractor>,
    importer: Arc<FolderImporter>,
    work_dir: PathBuf,
}

impl ImportWorker {
    pub fn new(
        extractor: Arc<dyn ArchiveExtractor>,
        importer: Arc<FolderImporter>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            extractor,
            importer,
            work_dir: work_dir.into(),
        }
    }

    /// Process requests until the stream ends or `cancel` fires. An archive
    /// already being imported finishes its current file first.
    pub async fn run<S>(self, requests: S, cancel: CancellationToken)
    where
        S: Stream<Item = ImportRequest> + Unpin,
    {
        let mut requests = requests;
        info!(subsystem = "ingest", component = "import_worker", "Import worker started");
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                next = requests.next() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.process(&request, &cancel).await {
                error!(
                    subsystem = "ingest",
                    component = "import_worker",
                    archive = %request.original_name,
                    error = %e,
                    "Archive import failed"
                );
            }
        }
        info!(subsystem = "ingest", component = "import_worker", "Import worker stopped");
    }

    /// Extract and import one archive. The staged archive and the extraction
    /// directory are removed whatever the outcome.
    pub async fn process(
        &self,
        request: &ImportRequest,
        cancel: &CancellationToken,
    ) -> Result<ImportSummary> {
        let extract_dir = self.work_dir.join(Uuid::new_v4().simple().to_string());
        let outcome = self.extract_and_import(request, &extract_dir, cancel).await;
        remove_staged(&request.archive_path, "import_worker").await;
        cleanup_dir(&extract_dir).await;

        if let Ok(summary) = &outcome {
            info!(
                subsystem = "ingest",
                component = "import_worker",
                archive = %request.original_name,
                processed = summary.processed,
                errors = summary.errors,
                "Archive import finished"
            );
        }
        outcome
    }

    async fn extract_and_import(
        &self,
        request: &ImportRequest,
        extract_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImportSummary> {
        tokio::fs::create_dir_all(extract_dir).await?;
        self.extractor
            .extract(&request.archive_path, extract_dir)
            .await?;
        self.importer.import(extract_dir, cancel).await
    }
}

async fn cleanup_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                subsystem = "ingest",
                component = "import_worker",
                path = %path.display(),
                error = %e,
                "Failed to clean up extraction directory"
            );
        }
    }
}
