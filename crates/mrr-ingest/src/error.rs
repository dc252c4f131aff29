//! Error types for mrr-ingest.
//!
//! This module defines all error types used throughout the mrr-ingest crate,
//! providing detailed context for debugging and user-friendly error messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for mrr-ingest operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Transport Errors ===
    /// Failed to open the serial device.
    #[error("failed to open serial device {device}: {source}")]
    TransportOpen {
        /// The device that could not be opened.
        device: String,
        /// The underlying error.
        #[source]
        source: serialport::Error,
    },

    // === Framing Errors ===
    /// A line payload could not be decoded as UTF-8 text.
    ///
    /// Fails the current assembly pass; the ingestion loop restarts
    /// assembly rather than terminating the process.
    #[error("undecodable payload in record line: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    // === Dispatch Errors ===
    /// The external converter exited unsuccessfully.
    ///
    /// The selected raw files are left in place for reprocessing.
    #[error("converter {program} failed for product {product}: {message}")]
    ConverterFailed {
        /// The converter program that was invoked.
        program: String,
        /// The derived product filename passed to it.
        product: String,
        /// Exit status or spawn failure description.
        message: String,
    },

    /// The upload sink rejected a file.
    #[error("upload of {path} failed: {message}")]
    Upload {
        /// Path that was handed to the sink.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to relocate a closed output file into durable storage.
    #[error("failed to move {from} to {to}: {source}")]
    Relocate {
        /// The closed file in the work directory.
        from: PathBuf,
        /// The destination in the storage directory.
        to: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for mrr-ingest operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a converter failure error.
    #[must_use]
    pub fn converter_failed(
        program: impl Into<String>,
        product: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConverterFailed {
            program: program.into(),
            product: product.into(),
            message: message.into(),
        }
    }

    /// Create an upload error.
    #[must_use]
    pub fn upload(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Upload {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is a payload decode failure.
    ///
    /// The ingestion loop uses this to distinguish "restart the assembly
    /// pass" from errors that should abort the run.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
