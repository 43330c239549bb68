//! Zip archive extraction.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use tender_core::{ArchiveExtractor, Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ZipExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn archive_err(e: impl std::fmt::Display) -> Error {
    Error::Archive(e.to_string())
}

/// Extract every entry of `archive` below `destination`, overwriting files.
/// Entries whose path would escape `destination` fail the whole archive.
fn extract_blocking(archive: &Path, destination: &Path) -> Result<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(archive_err)?;
    fs::create_dir_all(destination)?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(archive_err)?;
        let relative: PathBuf = entry
            .enclosed_name()
            .ok_or_else(|| Error::Archive(format!("entry '{}' escapes destination", entry.name())))?;
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}

#[async_trait]
impl ArchiveExtractor for ZipExtractor {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<usize> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        let written = tokio::task::spawn_blocking(move || extract_blocking(&archive, &destination))
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))??;
        debug!(
            subsystem = "ingest",
            component = "zip",
            files = written,
            "Archive extracted"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extracts_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, &[("one.xml", "1"), ("nested/two.xml", "2")]);

        let out = dir.path().join("out");
        let written = ZipExtractor::new().extract(&archive, &out).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(fs::read_to_string(out.join("nested/two.xml")).unwrap(), "2");
    }

    #[tokio::test]
    async fn test_rejects_escaping_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../evil.xml", "x")]);

        let err = ZipExtractor::new()
            .extract(&archive, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
        assert!(!dir.path().join("evil.xml").exists());
    }

    #[tokio::test]
    async fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        fs::write(&archive, b"not a zip").unwrap();
        let err = ZipExtractor::new()
            .extract(&archive, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }
}
