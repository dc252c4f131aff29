//! Upload sink abstraction.
//!
//! Closed output files and derived product files are handed to an upload
//! sink for publication. The sink's delivery mechanics are external to
//! this daemon; [`OutboxSink`] stages files into an outbox directory for
//! an external shipper to collect.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A destination for files leaving the daemon.
///
/// `keep` tells the sink whether the caller retains the source file:
/// output files are uploaded with `keep = true` (they still feed the
/// hourly conversion), derived products with `keep = false` (the sink
/// takes ownership).
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Hand `path` to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upload`] if the file could not be accepted.
    async fn upload(&self, path: &Path, keep: bool) -> Result<()>;
}

/// Sink that stages files into an outbox directory.
///
/// With `keep = true` the source file is copied; with `keep = false` it
/// is moved (rename, falling back to copy-and-remove across filesystems).
#[derive(Debug, Clone)]
pub struct OutboxSink {
    outbox_dir: PathBuf,
}

impl OutboxSink {
    /// Create the sink, creating the outbox directory if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryCreate`] if the directory cannot be made.
    pub fn new(outbox_dir: impl Into<PathBuf>) -> Result<Self> {
        let outbox_dir = outbox_dir.into();
        std::fs::create_dir_all(&outbox_dir).map_err(|source| Error::DirectoryCreate {
            path: outbox_dir.clone(),
            source,
        })?;
        Ok(Self { outbox_dir })
    }

    /// The directory files are staged into.
    #[must_use]
    pub fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }
}

#[async_trait]
impl UploadSink for OutboxSink {
    async fn upload(&self, path: &Path, keep: bool) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::upload(path, "path has no file name"))?;
        let dest = self.outbox_dir.join(file_name);

        if keep {
            tokio::fs::copy(path, &dest)
                .await
                .map_err(|e| Error::upload(path, e.to_string()))?;
        } else if tokio::fs::rename(path, &dest).await.is_err() {
            // Rename fails across filesystems; copy then remove
            tokio::fs::copy(path, &dest)
                .await
                .map_err(|e| Error::upload(path, e.to_string()))?;
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| Error::upload(path, e.to_string()))?;
        }

        debug!(file = %dest.display(), keep, "Staged file in outbox");
        Ok(())
    }
}

/// Sink that logs uploads without delivering them anywhere.
///
/// Useful when no shipper is configured; publication becomes a no-op but
/// the rest of the pipeline (rotation, conversion, deletion) proceeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl UploadSink for NullSink {
    async fn upload(&self, path: &Path, keep: bool) -> Result<()> {
        info!(file = %path.display(), keep, "Upload sink disabled; skipping transfer");
        Ok(())
    }
}

/// Sink recording every call, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    calls: std::sync::Mutex<Vec<(PathBuf, bool)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(PathBuf, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl UploadSink for MemorySink {
    async fn upload(&self, path: &Path, keep: bool) -> Result<()> {
        self.calls.lock().unwrap().push((path.to_path_buf(), keep));
        Ok(())
    }
}
