//! Import pipeline configuration.

use std::path::PathBuf;

use tender_core::defaults::{
    IMPORT_QUEUE_CAPACITY, IMPORT_SOURCE, IMPORT_WORK_DIR, NOTIFICATION_EXTENSION,
    UPLOAD_CACHE_DIR,
};
use tender_core::ActivationPolicy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Archives the intake queue holds before producers block.
    pub queue_capacity: usize,
    /// Where uploaded archives are staged until the worker picks them up.
    pub upload_cache_dir: PathBuf,
    /// Parent of the per-archive extraction directories.
    pub work_dir: PathBuf,
    /// Extension (without dot) of notification files.
    pub file_extension: String,
    /// Directory imported once at startup.
    pub startup_import_dir: Option<PathBuf>,
    pub activation_policy: ActivationPolicy,
    /// `source` recorded on notices imported from archives.
    pub source: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            queue_capacity: IMPORT_QUEUE_CAPACITY,
            upload_cache_dir: tmp.join(UPLOAD_CACHE_DIR),
            work_dir: tmp.join(IMPORT_WORK_DIR),
            file_extension: NOTIFICATION_EXTENSION.to_string(),
            startup_import_dir: None,
            activation_policy: ActivationPolicy::default(),
            source: IMPORT_SOURCE.to_string(),
        }
    }
}

impl IngestConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `IMPORT_QUEUE_CAPACITY` | `10` | Bounded intake queue size |
    /// | `IMPORT_UPLOAD_CACHE_DIR` | `<tmp>/tender-upload-cache` | Staged archives |
    /// | `IMPORT_WORK_DIR` | `<tmp>/tender-import` | Extraction root |
    /// | `IMPORT_FILE_EXTENSION` | `xml` | Notification file extension |
    /// | `XML_IMPORT_DIRECTORY` | - | Directory imported at startup |
    /// | `VERSION_ACTIVATION_POLICY` | `last-ingested` | `last-ingested` or `highest-version` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let queue_capacity = non_empty("IMPORT_QUEUE_CAPACITY")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.queue_capacity)
            .max(1);

        let activation_policy = match non_empty("VERSION_ACTIVATION_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(
                    subsystem = "ingest",
                    component = "config",
                    error = %e,
                    "Invalid activation policy, using default"
                );
                defaults.activation_policy
            }),
            None => defaults.activation_policy,
        };

        Self {
            queue_capacity,
            upload_cache_dir: non_empty("IMPORT_UPLOAD_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_cache_dir),
            work_dir: non_empty("IMPORT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            file_extension: non_empty("IMPORT_FILE_EXTENSION")
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .unwrap_or(defaults.file_extension),
            startup_import_dir: non_empty("XML_IMPORT_DIRECTORY").map(PathBuf::from),
            activation_policy,
            source: defaults.source,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_dirs(mut self, upload_cache_dir: PathBuf, work_dir: PathBuf) -> Self {
        self.upload_cache_dir = upload_cache_dir;
        self.work_dir = work_dir;
        self
    }

    pub fn with_activation_policy(mut self, policy: ActivationPolicy) -> Self {
        self.activation_policy = policy;
        self
    }

    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }
}
