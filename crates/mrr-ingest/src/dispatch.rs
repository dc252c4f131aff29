//! Hourly batch dispatch.
//!
//! Once per hour boundary, the ingestion loop launches one dispatcher
//! pass that folds the *previous* hour's closed output files into one
//! derived product file, publishes it, and reclaims disk space.
//! Conversion runs one hour in arrears so the hour's files are all
//! closed and relocated before they are consumed.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ConverterConfig;
use crate::error::{Error, Result};
use crate::upload::UploadSink;

/// Derived product filename for the given hour
/// (`mrr2atmos.<yyyyMMdd>_<HH>0000.nc`).
#[must_use]
pub fn product_file_name(hour: DateTime<Utc>) -> String {
    format!("mrr2atmos.{}0000.nc", hour.format("%Y%m%d_%H"))
}

/// Output-file name prefix selecting one hour's batch (`yyMMddHH`).
#[must_use]
pub fn batch_prefix(hour: DateTime<Utc>) -> String {
    hour.format("%y%m%d%H").to_string()
}

/// Folds one hour's output files into a derived product and publishes it.
///
/// The dispatcher is the sole deleter in the storage directory, and only
/// deletes inputs it has successfully converted; a converter failure
/// leaves the hour's files in place for reprocessing. Overlapping passes
/// are excluded by an internal guard: a pass that finds a previous pass
/// still running skips with a warning.
pub struct HourlyDispatcher {
    raw_dir: PathBuf,
    converter: ConverterConfig,
    sink: Arc<dyn UploadSink>,
    pass_guard: Mutex<()>,
}

impl std::fmt::Debug for HourlyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HourlyDispatcher")
            .field("raw_dir", &self.raw_dir)
            .field("converter", &self.converter)
            .finish_non_exhaustive()
    }
}

impl HourlyDispatcher {
    /// Create a dispatcher over the storage directory.
    pub fn new(
        raw_dir: impl Into<PathBuf>,
        converter: ConverterConfig,
        sink: Arc<dyn UploadSink>,
    ) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            converter,
            sink,
            pass_guard: Mutex::new(()),
        }
    }

    /// Run one pass for the hour preceding `invoked_at`.
    ///
    /// Skips (successfully) if a previous pass is still running.
    ///
    /// # Errors
    ///
    /// Propagates conversion, upload, and filesystem errors; the launching
    /// task logs them, ingestion is never affected.
    pub async fn run_pass(&self, invoked_at: DateTime<Utc>) -> Result<()> {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            warn!("previous dispatcher pass still running; skipping this hour");
            return Ok(());
        };
        let hour = invoked_at - Duration::hours(1);
        self.process_hour(hour).await
    }

    /// Convert and publish the batch for one specific hour.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConverterFailed`] on non-zero converter exit (the
    /// batch is left untouched), upload errors from the sink, and I/O
    /// errors from selection or deletion.
    pub async fn process_hour(&self, hour: DateTime<Utc>) -> Result<()> {
        let product = product_file_name(hour);
        let batch = self.select_batch(hour)?;

        if batch.is_empty() {
            info!(prefix = %batch_prefix(hour), "No raw files for hour; nothing to publish");
            return Ok(());
        }

        info!(
            product = %product,
            files = batch.len(),
            "Converting hour"
        );
        self.run_converter(&product).await?;

        let product_path = self.raw_dir.join(&product);
        self.sink.upload(&product_path, false).await?;

        for file in &batch {
            std::fs::remove_file(file)?;
        }

        info!(product = %product, consumed = batch.len(), "Published");
        Ok(())
    }

    /// Select the storage-directory files belonging to `hour`'s batch:
    /// names carrying the hour's `yyMMddHH` prefix and the `.raw` suffix.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from reading the storage directory.
    pub fn select_batch(&self, hour: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let prefix = batch_prefix(hour);
        let mut batch = Vec::new();
        for entry in std::fs::read_dir(&self.raw_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".raw") {
                batch.push(entry.path());
            }
        }
        batch.sort();
        Ok(batch)
    }

    /// Invoke the external converter with the product filename as its
    /// final argument, in the storage directory. Only the exit status is
    /// consumed; the converter locates raw inputs itself.
    async fn run_converter(&self, product: &str) -> Result<()> {
        let status = tokio::process::Command::new(&self.converter.program)
            .args(&self.converter.args)
            .arg(product)
            .current_dir(&self.raw_dir)
            .status()
            .await
            .map_err(|e| {
                Error::converter_failed(&self.converter.program, product, e.to_string())
            })?;

        if !status.success() {
            return Err(Error::converter_failed(
                &self.converter.program,
                product,
                format!("exit status {status}"),
            ));
        }
        Ok(())
    }
}
