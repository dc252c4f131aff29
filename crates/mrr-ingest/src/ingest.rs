//! The ingestion loop.
//!
//! One foreground task drives assembly passes back to back: each pass
//! blocks on serial reads (so it runs on the blocking thread pool) and
//! ends when its output file closes at an hour boundary. After every
//! completed pass the loop re-evaluates the wall clock and, at most once
//! per hour, launches a dispatcher pass fire-and-forget — ingestion is
//! never blocked by conversion I/O.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::dispatch::HourlyDispatcher;
use crate::error::{Error, Result};
use crate::framing::{self, ClosedFile};
use crate::transport::LineTransport;
use crate::upload::UploadSink;

/// Once-per-hour launch gate.
///
/// Owned by the ingestion loop (no process-wide state): reports "launch"
/// exactly once while the clock sits in the zero-minute window, and
/// re-arms as soon as the window is left.
#[derive(Debug, Default)]
pub struct HourGate {
    published_this_hour: bool,
}

impl HourGate {
    /// Create a gate that has not fired for the current hour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe the wall clock; returns `true` exactly when a dispatcher
    /// pass should be launched.
    pub fn observe(&mut self, now: DateTime<Utc>) -> bool {
        if now.minute() == 0 {
            if self.published_this_hour {
                false
            } else {
                self.published_this_hour = true;
                true
            }
        } else {
            self.published_this_hour = false;
            false
        }
    }
}

/// The ingestion loop: assembly passes, pass completion (upload +
/// relocation), and hourly dispatch gating.
pub struct IngestLoop<C: Clock + Clone + 'static> {
    work_dir: PathBuf,
    raw_dir: PathBuf,
    clock: C,
    sink: Arc<dyn UploadSink>,
    dispatcher: Arc<HourlyDispatcher>,
}

impl<C: Clock + Clone + 'static> std::fmt::Debug for IngestLoop<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestLoop")
            .field("work_dir", &self.work_dir)
            .field("raw_dir", &self.raw_dir)
            .finish_non_exhaustive()
    }
}

impl<C: Clock + Clone + 'static> IngestLoop<C> {
    /// Create the loop.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        raw_dir: impl Into<PathBuf>,
        clock: C,
        sink: Arc<dyn UploadSink>,
        dispatcher: Arc<HourlyDispatcher>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            raw_dir: raw_dir.into(),
            clock,
            sink,
            dispatcher,
        }
    }

    /// Run until process termination.
    ///
    /// # Errors
    ///
    /// Returns only on errors that cannot be recovered by restarting the
    /// assembly pass (filesystem failures, a panicked assembly task).
    pub async fn run<T>(self, mut transport: T) -> Result<()>
    where
        T: LineTransport + 'static,
    {
        let mut gate = HourGate::new();
        info!("Ingestion loop started");
        loop {
            transport = self.run_once(transport, &mut gate).await?;
        }
    }

    /// One loop iteration: a single assembly pass followed by one hour
    /// gate evaluation.
    ///
    /// A decode failure restarts assembly on the next iteration instead
    /// of propagating; the gate is evaluated either way, matching the
    /// per-pass polling cadence of the boundary check.
    ///
    /// # Errors
    ///
    /// Propagates non-recoverable pass errors (see [`Self::run`]).
    pub async fn run_once<T>(&self, mut transport: T, gate: &mut HourGate) -> Result<T>
    where
        T: LineTransport + 'static,
    {
        let clock = self.clock.clone();
        let work_dir = self.work_dir.clone();
        let (transport, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = framing::run_pass(&mut transport, &clock, &work_dir);
            (transport, outcome)
        })
        .await
        .map_err(|e| Error::internal(format!("assembly task panicked: {e}")))?;

        match outcome {
            Ok(closed) => {
                self.complete_pass(closed).await?;
            }
            Err(e) if e.is_decode() => {
                warn!(error = %e, "assembly pass failed; restarting");
            }
            Err(e) => return Err(e),
        }

        let now = self.clock.now_utc();
        if gate.observe(now) {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run_pass(now).await {
                    error!(error = %e, "dispatcher pass failed");
                }
            });
        }

        Ok(transport)
    }

    /// Finish a completed pass: hand the closed file to the upload sink
    /// (best effort, retained) and relocate it into durable storage. The
    /// rename is the synchronization point after which the dispatcher may
    /// observe the file.
    async fn complete_pass(&self, closed: ClosedFile) -> Result<PathBuf> {
        if let Err(e) = self.sink.upload(&closed.path, true).await {
            warn!(file = %closed.file_name, error = %e, "upload failed; file kept locally");
        }

        let dest = self.raw_dir.join(&closed.file_name);
        std::fs::rename(&closed.path, &dest).map_err(|source| Error::Relocate {
            from: closed.path.clone(),
            to: dest.clone(),
            source,
        })?;

        info!(file = %closed.file_name, "Output file relocated to storage");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::ConverterConfig;
    use crate::transport::ScriptedTransport;
    use crate::upload::MemorySink;
    use chrono::TimeZone;

    fn rotation_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 3).unwrap()
    }

    fn test_loop(
        work: &std::path::Path,
        raw: &std::path::Path,
        clock: FixedClock,
        sink: Arc<MemorySink>,
    ) -> IngestLoop<FixedClock> {
        let dispatcher = Arc::new(HourlyDispatcher::new(
            raw,
            ConverterConfig {
                program: "touch".to_string(),
                args: vec![],
            },
            sink.clone(),
        ));
        IngestLoop::new(work, raw, clock, sink, dispatcher)
    }

    #[test]
    fn test_hour_gate_fires_once_per_hour() {
        let mut gate = HourGate::new();
        let t = |h, m, s| Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap();

        assert!(gate.observe(t(13, 0, 5)));
        assert!(!gate.observe(t(13, 0, 30))); // same window, already fired
        assert!(!gate.observe(t(13, 15, 0))); // re-arms
        assert!(!gate.observe(t(13, 59, 59)));
        assert!(gate.observe(t(14, 0, 2))); // next hour fires again
        assert!(!gate.observe(t(14, 0, 59)));
    }

    #[test]
    fn test_hour_gate_starts_unfired() {
        let mut gate = HourGate::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
        assert!(gate.observe(now));
    }

    #[tokio::test]
    async fn test_run_once_uploads_and_relocates() {
        let work = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let clock = FixedClock::new(rotation_time());
        let ingest = test_loop(work.path(), raw.path(), clock, sink.clone());

        let mut transport = ScriptedTransport::new();
        transport
            .push_line(b"\x01HEADERDATAXXXXX\n")
            .push_line(b"\x02BODYDATAXXXXX\n")
            .push_line(b"\x04ENDXXXXX\n");

        let mut gate = HourGate::new();
        // Pre-fire the gate so no dispatcher pass launches here
        assert!(gate.observe(rotation_time()));

        ingest.run_once(transport, &mut gate).await.unwrap();

        // Uploaded with retention, from its work-directory path
        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, work.path().join("240101130003.raw"));
        assert!(calls[0].1);

        // Relocated: gone from work, present in storage
        assert!(!work.path().join("240101130003.raw").exists());
        let relocated = raw.path().join("240101130003.raw");
        assert_eq!(
            std::fs::read_to_string(relocated).unwrap(),
            "MRR 240101130003 UTC HEADERDATA\nBODYDATA\n"
        );
    }

    #[tokio::test]
    async fn test_run_once_recovers_from_decode_error() {
        let work = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let clock = FixedClock::new(rotation_time());
        let ingest = test_loop(work.path(), raw.path(), clock, sink.clone());

        let mut gate = HourGate::new();
        gate.observe(rotation_time());

        // First pass dies on an undecodable payload
        let mut transport = ScriptedTransport::new();
        transport.push_line(b"\x01HEAD\xffDATAXXXXX\n");
        let transport = ingest.run_once(transport, &mut gate).await.unwrap();
        assert!(sink.calls().is_empty());
        drop(transport);

        // The next pass proceeds normally
        let mut transport = ScriptedTransport::new();
        transport
            .push_line(b"\x01HEADERDATAXXXXX\n")
            .push_line(b"\x04ENDXXXXX\n");
        ingest.run_once(transport, &mut gate).await.unwrap();
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_run_once_launches_dispatcher_at_hour_boundary() {
        let work = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let clock = FixedClock::new(rotation_time());
        let ingest = test_loop(work.path(), raw.path(), clock, sink.clone());

        // A closed file from the previous hour, awaiting conversion
        std::fs::write(raw.path().join("240101125900.raw"), "MRR data\n").unwrap();

        let mut transport = ScriptedTransport::new();
        transport
            .push_line(b"\x01HEADERDATAXXXXX\n")
            .push_line(b"\x04ENDXXXXX\n");

        let mut gate = HourGate::new();
        ingest.run_once(transport, &mut gate).await.unwrap();

        // The fired gate stays closed for the rest of the window
        assert!(!gate.observe(rotation_time()));

        // Give the fire-and-forget pass time to finish
        for _ in 0..50 {
            if !raw.path().join("240101125900.raw").exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!raw.path().join("240101125900.raw").exists());

        // Product for hour 12 published without retention
        let product_calls: Vec<_> = sink.calls().into_iter().filter(|c| !c.1).collect();
        assert_eq!(product_calls.len(), 1);
        assert_eq!(
            product_calls[0].0,
            raw.path().join("mrr2atmos.20240101_120000.nc")
        );
    }
}
