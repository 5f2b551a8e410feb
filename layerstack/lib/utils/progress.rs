use std::io::{self, Read, Write};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many bytes pass between two progress reports for the same label.
const PROGRESS_REPORT_INTERVAL: u64 = 8 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reader adapter that reports incremental progress under a label as bytes pass through.
///
/// Progress reporting is a side channel only: reads are forwarded to the inner reader
/// unchanged and the first I/O error is propagated as-is.
pub struct ProgressReader<R> {
    inner: R,
    label: String,
    bytes: u64,
    last_report: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<R: Read> ProgressReader<R> {
    /// Wraps `inner`, reporting progress under `label`.
    pub fn new(inner: R, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            bytes: 0,
            last_report: 0,
        }
    }

    /// The number of bytes read through this adapter so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies all bytes from `reader` to `writer`, reporting incremental progress under `label`.
///
/// Returns the number of bytes copied, or the first I/O error encountered on either side.
pub fn copy_with_progress<W, R>(writer: &mut W, reader: R, label: &str) -> io::Result<u64>
where
    W: Write,
    R: Read,
{
    let mut reader = ProgressReader::new(reader, label);
    let copied = io::copy(&mut reader, writer)?;
    tracing::trace!(label, bytes = copied, "copy finished");
    Ok(copied)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes += n as u64;
        if self.bytes - self.last_report >= PROGRESS_REPORT_INTERVAL {
            self.last_report = self.bytes;
            tracing::debug!(label = %self.label, bytes = self.bytes, "copying");
        }
        Ok(n)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
