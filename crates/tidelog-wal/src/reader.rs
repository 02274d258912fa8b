//! Sequential decoding of a single WAL file.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::warn;

use tidelog_core::{Result, WalError};

use crate::entry::{WalEntry, RECORD_OVERHEAD};

/// Largest frame the reader will materialize; anything bigger is treated
/// as corruption rather than attempted as an allocation.
const MAX_FRAME_LEN: u32 = 1 << 30;

enum ReadOutcome {
    Full,
    Eof,
    Partial,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Forward-only reader over one log file.
///
/// A truncated tail (a crash mid-append) ends the file silently after the
/// last complete record. A checksum failure ends the file with an error;
/// records decoded before it remain valid. A record whose body alone fails
/// to decode is skipped with a logged error.
pub struct WalFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    done: bool,
}

impl WalFileReader {
    /// Opens a log file for sequential reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            done: false,
        })
    }

    /// Returns the next entry, or `None` at the end of the file.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        loop {
            if self.done {
                return Ok(None);
            }

            let mut len_bytes = [0u8; 4];
            match read_exact_or_eof(&mut self.reader, &mut len_bytes)? {
                ReadOutcome::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                ReadOutcome::Partial => {
                    warn!(path = %self.path.display(), "truncated record length at end of wal file");
                    self.done = true;
                    return Ok(None);
                }
                ReadOutcome::Full => {}
            }

            let len = u32::from_le_bytes(len_bytes);
            if len < (RECORD_OVERHEAD as u32 - 4) || len > MAX_FRAME_LEN {
                self.done = true;
                return Err(WalError::Corrupt(format!("unreasonable record length {len}")));
            }

            let mut frame = vec![0u8; len as usize];
            match read_exact_or_eof(&mut self.reader, &mut frame)? {
                ReadOutcome::Full => {}
                ReadOutcome::Eof | ReadOutcome::Partial => {
                    warn!(path = %self.path.display(), "truncated record at end of wal file");
                    self.done = true;
                    return Ok(None);
                }
            }

            match WalEntry::decode_frame(&frame) {
                Ok(entry) => return Ok(Some(entry)),
                Err(WalError::Serialization(e)) => {
                    warn!(path = %self.path.display(), error = %e, "skipping undecodable wal record");
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
    }

    /// Path of the file being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
