//! `mrr-ingest` - Serial ingest and hourly publication for the MRR-2 radar
//!
//! This library provides the core functionality for reassembling the
//! MRR-2's control-byte-framed serial stream into timestamped raw files
//! and folding each completed hour's files into a published data product.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod ingest;
pub mod logging;
pub mod transport;
pub mod upload;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use framing::{ClosedFile, FrameEvent, RecordFramer};
pub use logging::init_logging;
pub use transport::{LineTransport, SerialLineTransport};
pub use upload::UploadSink;
