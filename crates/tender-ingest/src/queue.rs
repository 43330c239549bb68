//! Bounded intake queue for uploaded archives.
//!
//! `enqueue` stages the upload on disk, then waits for room in the queue.
//! When the queue is full the producer blocks until the worker takes an item.
//! The queue has exactly one consumer; [`ImportQueue::dequeue`] hands out its
//! stream once.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use tender_core::defaults::DEFAULT_ARCHIVE_NAME;
use tender_core::{Error, Result};

/// A staged archive waiting for import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub archive_path: PathBuf,
    pub original_name: String,
}

pub struct ImportQueue {
    sender: mpsc::Sender<ImportRequest>,
    receiver: Mutex<Option<mpsc::Receiver<ImportRequest>>>,
    storage_dir: PathBuf,
    capacity: usize,
}

/// Final path component of a client-supplied name, or the default name.
pub fn safe_file_name(file_name: Option<&str>) -> String {
    file_name
        .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n).trim())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string())
}

impl ImportQueue {
    /// Create the queue and its staging directory.
    pub fn new(capacity: usize, storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            storage_dir,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Items currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stage `reader` to disk and queue it, waiting while the queue is full.
    pub async fn enqueue<R>(&self, mut reader: R, file_name: Option<&str>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let original_name = safe_file_name(file_name);
        let archive_path = self
            .storage_dir
            .join(format!("{}_{}", Uuid::new_v4().simple(), original_name));

        if let Err(e) = stage(&mut reader, &archive_path).await {
            remove_staged(&archive_path, "import_queue").await;
            return Err(e);
        }

        let request = ImportRequest {
            archive_path: archive_path.clone(),
            original_name: original_name.clone(),
        };
        if self.sender.send(request).await.is_err() {
            remove_staged(&archive_path, "import_queue").await;
            return Err(Error::Unavailable("import queue is closed".to_string()));
        }

        info!(
            subsystem = "ingest",
            component = "import_queue",
            archive = %original_name,
            "Archive queued for import"
        );
        Ok(())
    }

    /// The consumer side. Only the first call succeeds.
    pub fn dequeue(&self) -> Result<ReceiverStream<ImportRequest>> {
        self.receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| Error::Internal("import queue already has a consumer".to_string()))
    }
}

async fn stage<R: AsyncRead + Unpin>(reader: &mut R, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(())
}

/// Remove a staged archive, logging any failure other than an already
/// missing file.
pub(crate) async fn remove_staged(path: &Path, component: &str) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                subsystem = "ingest",
                component,
                op = "cleanup",
                path = %path.display(),
                error = %e,
                "Failed to remove staged archive"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name(Some("../../etc/passwd")), "passwd");
        assert_eq!(safe_file_name(Some("C:\\uploads\\a.zip")), "a.zip");
        assert_eq!(safe_file_name(Some("  ")), DEFAULT_ARCHIVE_NAME);
        assert_eq!(safe_file_name(Some("dir/")), DEFAULT_ARCHIVE_NAME);
        assert_eq!(safe_file_name(None), DEFAULT_ARCHIVE_NAME);
    }

    #[tokio::test]
    async fn test_enqueue_stages_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImportQueue::new(2, dir.path()).unwrap();
        queue.enqueue(&b"PK data"[..], Some("x.zip")).await.unwrap();
        assert_eq!(queue.len(), 1);

        let mut stream = queue.dequeue().unwrap();
        let request = tokio_stream::StreamExt::next(&mut stream).await.unwrap();
        assert_eq!(request.original_name, "x.zip");
        assert!(request.archive_path.starts_with(dir.path()));
        assert!(request
            .archive_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_x.zip"));
        assert_eq!(tokio::fs::read(&request.archive_path).await.unwrap(), b"PK data");
    }

    #[tokio::test]
    async fn test_single_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImportQueue::new(1, dir.path()).unwrap();
        let _stream = queue.dequeue().unwrap();
        assert!(queue.dequeue().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImportQueue::new(1, dir.path()).unwrap();
        drop(queue.dequeue().unwrap());

        let err = queue.enqueue(&b"data"[..], Some("a.zip")).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_remove_staged_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("a.zip");
        tokio::fs::write(&staged, b"PK").await.unwrap();

        remove_staged(&staged, "import_queue").await;
        assert!(!staged.exists());

        remove_staged(&staged, "import_worker").await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
