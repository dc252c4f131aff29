//! Frame assembly for the MRR-2 record protocol.
//!
//! The instrument delivers one logical radar scan as a framed sequence of
//! lines: a header line opening the record, any number of spectra lines,
//! and an end line closing it. The first byte of each line is a control
//! marker; the remainder is the payload, followed by a fixed-width
//! checksum/terminator trailer supplied by the instrument.
//!
//! [`RecordFramer`] is the state machine that turns those lines into
//! timestamped records appended to a rotating output file, and
//! [`run_pass`] drives it from a [`LineTransport`] for the lifetime of
//! one output file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::transport::LineTransport;

/// Control marker opening a record (header line follows).
pub const START_OF_RECORD: u8 = 0x01;
/// Control marker for a raw spectra line within a record.
pub const SPECTRA_LINE: u8 = 0x02;
/// Control marker closing a record.
pub const END_OF_RECORD: u8 = 0x04;

/// Width of the trailing checksum/terminator bytes on every payload.
/// An instrument protocol constant, never reparsed from content.
const TRAILER_LEN: usize = 5;

/// Timestamp format used for output file names and record headers.
const FILE_TIME_FORMAT: &str = "%y%m%d%H%M%S";

/// The wall-clock window during which a completed record closes its file:
/// top of the hour, within the first ten seconds (bounding clock-skew
/// jitter around the boundary).
#[must_use]
pub fn in_rotation_window(t: DateTime<Utc>) -> bool {
    t.minute() == 0 && t.second() < 10
}

/// Format a capture timestamp the way output files and headers spell it.
#[must_use]
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(FILE_TIME_FORMAT).to_string()
}

/// Strip the control marker, the line terminator, and the instrument
/// trailer from a raw line, returning the text payload.
///
/// Lines too short to carry a trailer yield an empty payload.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is not valid UTF-8. This
/// fails the current assembly pass; the ingestion loop restarts it.
pub fn payload(line: &[u8]) -> Result<&str> {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    // One marker byte in front, TRAILER_LEN checksum bytes at the back
    let body = if end > 1 + TRAILER_LEN {
        &line[1..end - TRAILER_LEN]
    } else {
        &[][..]
    };
    std::str::from_utf8(body).map_err(|e| Error::decode(e.to_string()))
}

/// A closed output file, ready for upload and relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    /// The file name (`yyMMddHHmmss.raw`), derived from the timestamp of
    /// the record that opened the file.
    pub file_name: String,
    /// Where the file was written (inside the work directory).
    pub path: PathBuf,
    /// Number of records started in this file.
    pub records: u64,
}

/// What a line did to the framer state.
#[derive(Debug)]
pub enum FrameEvent {
    /// The line carried no marker we act on, or arrived in a state where
    /// it is not valid (e.g. a spectra line before any start marker).
    Ignored,
    /// A record was opened (and possibly the output file with it).
    RecordStarted,
    /// A spectra line was appended to the current record.
    BodyAppended,
    /// The record ended outside the rotation window; the file stays open
    /// for subsequent records.
    RecordEnded,
    /// The record ended inside the rotation window; the file is closed
    /// and the assembly pass is complete.
    FileClosed(ClosedFile),
}

struct OpenFile {
    writer: BufWriter<File>,
    file_name: String,
    path: PathBuf,
    records: u64,
}

/// State machine assembling marker-framed lines into one output file.
///
/// One framer instance lives for the duration of one assembly pass; its
/// output file is opened by the first start marker and closed by the
/// first end marker whose record began inside the rotation window.
pub struct RecordFramer {
    work_dir: PathBuf,
    out: Option<OpenFile>,
    /// Capture timestamp of the most recently started record. `Some`
    /// doubles as the "record started" state.
    record_start: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RecordFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFramer")
            .field("work_dir", &self.work_dir)
            .field("open_file", &self.out.as_ref().map(|o| &o.file_name))
            .field("record_start", &self.record_start)
            .finish()
    }
}

impl RecordFramer {
    /// Create a framer writing its output file under `work_dir`.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            out: None,
            record_start: None,
        }
    }

    /// Whether an output file is currently open.
    #[must_use]
    pub fn has_open_file(&self) -> bool {
        self.out.is_some()
    }

    /// Name of the currently open output file, if any.
    #[must_use]
    pub fn open_file_name(&self) -> Option<&str> {
        self.out.as_ref().map(|o| o.file_name.as_str())
    }

    /// Feed one raw line captured at `now` through the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for undecodable payloads and I/O errors
    /// for file creation or writes. Either failure ends the pass.
    pub fn accept(&mut self, line: &[u8], now: DateTime<Utc>) -> Result<FrameEvent> {
        match line.first() {
            Some(&START_OF_RECORD) => self.start_record(line, now),
            Some(&SPECTRA_LINE) => self.append_body(line),
            Some(&END_OF_RECORD) => self.end_record(),
            _ => Ok(FrameEvent::Ignored),
        }
    }

    fn start_record(&mut self, line: &[u8], now: DateTime<Utc>) -> Result<FrameEvent> {
        let text = payload(line)?;
        let time_str = format_timestamp(now);

        if self.record_start.is_some() {
            // The previous record never saw its end marker; the
            // instrument protocol assumes that does not happen.
            warn!(
                timestamp = %time_str,
                "start marker while a record is open; abandoning previous record"
            );
        }

        if self.out.is_none() {
            let file_name = format!("{time_str}.raw");
            let path = self.work_dir.join(&file_name);
            let file = File::create(&path)?;
            debug!(file = %file_name, "Opened output file");
            self.out = Some(OpenFile {
                writer: BufWriter::new(file),
                file_name,
                path,
                records: 0,
            });
        }

        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::internal("output file missing after open"))?;
        writeln!(out.writer, "MRR {time_str} UTC {text}")?;
        out.records += 1;
        self.record_start = Some(now);

        info!(timestamp = %time_str, "Start MRR record");
        Ok(FrameEvent::RecordStarted)
    }

    fn append_body(&mut self, line: &[u8]) -> Result<FrameEvent> {
        // Stray body lines before any start marker are ignored
        if self.record_start.is_none() {
            trace!("spectra line with no record open; ignored");
            return Ok(FrameEvent::Ignored);
        }
        let text = payload(line)?;
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::internal("record open without output file"))?;
        writeln!(out.writer, "{text}")?;
        Ok(FrameEvent::BodyAppended)
    }

    fn end_record(&mut self) -> Result<FrameEvent> {
        let Some(started_at) = self.record_start else {
            return Ok(FrameEvent::Ignored);
        };
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::internal("record open without output file"))?;
        out.writer.flush()?;

        // The rotation condition is evaluated against the capture time of
        // the record being closed, not the current wall clock.
        if !in_rotation_window(started_at) {
            return Ok(FrameEvent::RecordEnded);
        }

        let out = self
            .out
            .take()
            .ok_or_else(|| Error::internal("output file vanished at close"))?;
        // BufWriter was flushed above; dropping it closes the file
        let closed = ClosedFile {
            file_name: out.file_name,
            path: out.path,
            records: out.records,
        };
        self.record_start = None;
        info!(file = %closed.file_name, records = closed.records, "Closed output file");
        Ok(FrameEvent::FileClosed(closed))
    }
}

/// Run one assembly pass: drive a fresh [`RecordFramer`] from the
/// transport until it closes its output file.
///
/// Transport read errors are transient and retried indefinitely; this
/// function only returns once a file is closed or a line fails to
/// assemble.
///
/// # Errors
///
/// Returns [`Error::Decode`] for undecodable payloads and I/O errors from
/// writing the output file.
pub fn run_pass<T>(transport: &mut T, clock: &dyn Clock, work_dir: &Path) -> Result<ClosedFile>
where
    T: LineTransport + ?Sized,
{
    let mut framer = RecordFramer::new(work_dir);
    loop {
        let line = match transport.read_line() {
            Ok(line) => line,
            Err(e) => {
                trace!(error = %e, "transport read failed; retrying");
                continue;
            }
        };
        if let FrameEvent::FileClosed(closed) = framer.accept(&line, clock.now_utc())? {
            return Ok(closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::transport::ScriptedTransport;
    use chrono::TimeZone;

    fn rotation_time() -> DateTime<Utc> {
        // minute == 0, second == 3: inside the rotation window
        Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 3).unwrap()
    }

    fn mid_hour_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 13, 15, 0).unwrap()
    }

    #[test]
    fn test_rotation_window() {
        assert!(in_rotation_window(rotation_time()));
        assert!(in_rotation_window(
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap()
        ));
        assert!(in_rotation_window(
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 9).unwrap()
        ));
        // second == 10 is outside
        assert!(!in_rotation_window(
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 10).unwrap()
        ));
        assert!(!in_rotation_window(mid_hour_time()));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(rotation_time()), "240101130003");
    }

    #[test]
    fn test_payload_strips_marker_terminator_and_trailer() {
        assert_eq!(payload(b"\x01HEADERDATAXXXXX\n").unwrap(), "HEADERDATA");
        assert_eq!(payload(b"\x02BODYDATAXXXXX\n").unwrap(), "BODYDATA");
        assert_eq!(payload(b"\x04ENDXXXXX\n").unwrap(), "END");
    }

    #[test]
    fn test_payload_handles_crlf() {
        assert_eq!(payload(b"\x02BODYDATAXXXXX\r\n").unwrap(), "BODYDATA");
    }

    #[test]
    fn test_payload_short_line_is_empty() {
        assert_eq!(payload(b"\x04XXXXX\n").unwrap(), "");
        assert_eq!(payload(b"\x04\n").unwrap(), "");
        assert_eq!(payload(b"\x04").unwrap(), "");
    }

    #[test]
    fn test_payload_rejects_invalid_utf8() {
        let err = payload(b"\x01HEAD\xff\xfeDATAXXXXX\n").unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_record_closes_in_rotation_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());
        let t = rotation_time();

        framer.accept(b"\x01HEADERDATAXXXXX\n", t).unwrap();
        framer.accept(b"\x02BODYDATAXXXXX\n", t).unwrap();
        let event = framer.accept(b"\x04ENDXXXXX\n", t).unwrap();

        let FrameEvent::FileClosed(closed) = event else {
            panic!("expected FileClosed, got {event:?}");
        };
        assert_eq!(closed.file_name, "240101130003.raw");
        assert_eq!(closed.records, 1);
        assert!(!framer.has_open_file());

        let content = std::fs::read_to_string(&closed.path).unwrap();
        assert_eq!(content, "MRR 240101130003 UTC HEADERDATA\nBODYDATA\n");
    }

    #[test]
    fn test_record_outside_window_leaves_file_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());
        let t = mid_hour_time();

        framer.accept(b"\x01HEADERDATAXXXXX\n", t).unwrap();
        framer.accept(b"\x02BODYDATAXXXXX\n", t).unwrap();
        let event = framer.accept(b"\x04ENDXXXXX\n", t).unwrap();

        assert!(matches!(event, FrameEvent::RecordEnded));
        assert!(framer.has_open_file());
        assert_eq!(framer.open_file_name(), Some("240101131500.raw"));

        // The flush on record end makes the content visible on disk
        let content = std::fs::read_to_string(dir.path().join("240101131500.raw")).unwrap();
        assert_eq!(content, "MRR 240101131500 UTC HEADERDATA\nBODYDATA\n");
    }

    #[test]
    fn test_second_record_appends_to_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());

        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 59, 0).unwrap();
        framer.accept(b"\x01FIRSTXXXXX\n", t1).unwrap();
        framer.accept(b"\x04ENDXXXXX\n", t1).unwrap();

        // Still the same file, named from the first record's timestamp
        assert_eq!(framer.open_file_name(), Some("240101125900.raw"));

        let t2 = rotation_time();
        framer.accept(b"\x01SECONDXXXXX\n", t2).unwrap();
        let event = framer.accept(b"\x04ENDXXXXX\n", t2).unwrap();

        let FrameEvent::FileClosed(closed) = event else {
            panic!("expected FileClosed, got {event:?}");
        };
        assert_eq!(closed.file_name, "240101125900.raw");
        assert_eq!(closed.records, 2);

        let content = std::fs::read_to_string(&closed.path).unwrap();
        assert_eq!(
            content,
            "MRR 240101125900 UTC FIRST\nMRR 240101130003 UTC SECOND\n"
        );
    }

    #[test]
    fn test_close_count_matches_rotation_end_markers() {
        // A mix of end markers; only the one whose record started inside
        // the rotation window closes the file.
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());

        let mut closes = 0;
        let times = [
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 45, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 50, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 55, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 2).unwrap(),
        ];
        for t in times {
            framer.accept(b"\x01HEADERDATAXXXXX\n", t).unwrap();
            let event = framer.accept(b"\x04ENDXXXXX\n", t).unwrap();
            if matches!(event, FrameEvent::FileClosed(_)) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_spectra_line_ignored_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());

        let event = framer
            .accept(b"\x02BODYDATAXXXXX\n", mid_hour_time())
            .unwrap();
        assert!(matches!(event, FrameEvent::Ignored));
        assert!(!framer.has_open_file());
    }

    #[test]
    fn test_end_marker_ignored_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());

        let event = framer.accept(b"\x04ENDXXXXX\n", mid_hour_time()).unwrap();
        assert!(matches!(event, FrameEvent::Ignored));
    }

    #[test]
    fn test_unknown_marker_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());

        let event = framer.accept(b"\x03NOISEXXXXX\n", mid_hour_time()).unwrap();
        assert!(matches!(event, FrameEvent::Ignored));

        let event = framer.accept(b"", mid_hour_time()).unwrap();
        assert!(matches!(event, FrameEvent::Ignored));
    }

    #[test]
    fn test_restart_abandons_open_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());
        let t = mid_hour_time();

        framer.accept(b"\x01FIRSTXXXXX\n", t).unwrap();
        // No end marker: the next start silently supersedes the record
        let event = framer.accept(b"\x01SECONDXXXXX\n", t).unwrap();
        assert!(matches!(event, FrameEvent::RecordStarted));

        framer.accept(b"\x04ENDXXXXX\n", rotation_time()).unwrap();
    }

    #[test]
    fn test_decode_error_fails_accept() {
        let dir = tempfile::tempdir().unwrap();
        let mut framer = RecordFramer::new(dir.path());

        let err = framer
            .accept(b"\x01HEAD\xffDATAXXXXX\n", rotation_time())
            .unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_run_pass_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(rotation_time());

        let mut transport = ScriptedTransport::new();
        transport
            .push_line(b"\x01HEADERDATAXXXXX\n")
            .push_error(std::io::ErrorKind::TimedOut)
            .push_line(b"\x02BODYDATAXXXXX\n")
            .push_line(b"\x04ENDXXXXX\n");

        let closed = run_pass(&mut transport, &clock, dir.path()).unwrap();
        assert_eq!(closed.file_name, "240101130003.raw");

        let content = std::fs::read_to_string(&closed.path).unwrap();
        assert_eq!(content, "MRR 240101130003 UTC HEADERDATA\nBODYDATA\n");
    }

    #[test]
    fn test_run_pass_decode_error_fails_pass() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(rotation_time());

        let mut transport = ScriptedTransport::new();
        transport.push_line(b"\x01HEAD\xffDATAXXXXX\n");

        let err = run_pass(&mut transport, &clock, dir.path()).unwrap_err();
        assert!(err.is_decode());
    }
}
