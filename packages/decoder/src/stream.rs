//! Gzip line streaming.
//!
//! Lines are yielded as raw bytes so that a line with invalid UTF-8 is
//! rejected by the JSON decoder (a skippable, per-line failure) instead of
//! by the reader (which would end the whole stream).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;

/// Read buffer for the decompressed stream. Source lines are a few KB
/// each; a larger buffer keeps syscall counts down on multi-GB files.
const READ_BUFFER_BYTES: usize = 256 * 1024;

/// One physical line from the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based line number.
    pub number: u64,
    /// Line content without the trailing `\n` / `\r\n`.
    pub bytes: Vec<u8>,
}

impl Line {
    /// Whether the line holds only whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(u8::is_ascii_whitespace)
    }
}

/// Iterator over the lines of a (decompressed) reader.
///
/// Yields `Err` once if the underlying reader fails, then stops.
pub struct LineStream<R> {
    reader: R,
    line_number: u64,
    failed: bool,
}

/// Gzip-backed [`LineStream`] over a file on disk.
pub type GzLineStream = LineStream<BufReader<MultiGzDecoder<File>>>;

impl<R: BufRead> LineStream<R> {
    /// Wraps an already-buffered reader.
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for LineStream<R> {
    type Item = std::io::Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut bytes = Vec::new();
        match self.reader.read_until(b'\n', &mut bytes) {
            Ok(0) => None,
            Ok(_) => {
                if bytes.last() == Some(&b'\n') {
                    bytes.pop();
                }
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                self.line_number += 1;
                Some(Ok(Line {
                    number: self.line_number,
                    bytes,
                }))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Opens a gzip-compressed NDJSON file for line-by-line reading.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened.
pub fn open_lines(path: &Path) -> std::io::Result<GzLineStream> {
    let file = File::open(path)?;
    let decoder = MultiGzDecoder::new(file);
    Ok(LineStream::new(BufReader::with_capacity(
        READ_BUFFER_BYTES,
        decoder,
    )))
}
