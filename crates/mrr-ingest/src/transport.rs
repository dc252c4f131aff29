//! Serial line transport.
//!
//! The MRR-2 delivers newline-terminated lines over a serial link at a
//! fixed line speed. This module abstracts that link behind the
//! [`LineTransport`] trait so the frame assembler can be driven from a
//! scripted source in tests, and provides [`SerialLineTransport`] as the
//! production implementation on top of the `serialport` crate.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;

use serialport::{FlowControl, Parity, SerialPort};

use crate::error::{Error, Result};

/// Instrument line speed. A protocol constant, not configurable.
pub const BAUD_RATE: u32 = 57_600;

/// A source of transport-delimited raw byte lines.
///
/// `read_line` blocks until one complete line (including its terminator)
/// is available, or fails with an I/O error. Read errors are transient by
/// contract: callers retry rather than terminate.
pub trait LineTransport: Send {
    /// Read the next raw line, including its terminator.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on read failure or timeout. Bytes of a
    /// partially received line must not be lost across a failed call.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;
}

/// Buffered line framing over any byte reader.
///
/// Accumulates bytes until a `\n` is seen. A read error (e.g. the serial
/// timeout firing mid-line) leaves the partial line buffered, so the line
/// is completed on a later call instead of being torn.
pub struct BufferedLineReader<R: Read> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> BufferedLineReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Read until the next `\n`, carrying partial lines across errors.
    ///
    /// # Errors
    ///
    /// Propagates the underlying read error; already-received bytes stay
    /// buffered. Returns `UnexpectedEof` if the reader is exhausted.
    pub fn read_line(&mut self) -> io::Result<Vec<u8>> {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => {
                if self.pending.is_empty() {
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                } else {
                    // Trailing line without a terminator
                    Ok(std::mem::take(&mut self.pending))
                }
            }
            // read_until only stops short of the delimiter at EOF, so the
            // buffer holds one complete line either way
            Ok(_) => Ok(std::mem::take(&mut self.pending)),
            Err(e) => Err(e),
        }
    }
}

impl<R: Read> fmt::Debug for BufferedLineReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedLineReader")
            .field("pending_bytes", &self.pending.len())
            .finish()
    }
}

/// Serial transport to the MRR-2.
///
/// Opens the device at 57600 baud, no parity, software (XON/XOFF) flow
/// control, with the configured read timeout.
pub struct SerialLineTransport {
    device: String,
    lines: BufferedLineReader<Box<dyn SerialPort>>,
}

impl SerialLineTransport {
    /// Open the serial device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportOpen`] if the device cannot be opened or
    /// configured.
    pub fn open(device: &str, timeout: Duration) -> Result<Self> {
        let port = serialport::new(device, BAUD_RATE)
            .parity(Parity::None)
            .flow_control(FlowControl::Software)
            .timeout(timeout)
            .open()
            .map_err(|source| Error::TransportOpen {
                device: device.to_string(),
                source,
            })?;

        tracing::info!(device, baud = BAUD_RATE, "Serial connection open");

        Ok(Self {
            device: device.to_string(),
            lines: BufferedLineReader::new(port),
        })
    }

    /// The device this transport reads from.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Debug for SerialLineTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLineTransport")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl LineTransport for SerialLineTransport {
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.lines.read_line()
    }
}

/// A scripted transport for tests: yields a fixed sequence of outcomes,
/// then reports `UnexpectedEof` forever.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: std::collections::VecDeque<io::Result<Vec<u8>>>,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &[u8]) -> &mut Self {
        self.script.push_back(Ok(line.to_vec()));
        self
    }

    pub fn push_error(&mut self, kind: io::ErrorKind) -> &mut Self {
        self.script.push_back(Err(io::Error::from(kind)));
        self
    }
}

#[cfg(test)]
impl LineTransport for ScriptedTransport {
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::UnexpectedEof)))
    }
}
