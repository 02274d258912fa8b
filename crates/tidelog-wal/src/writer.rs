//! Append-only writer for a single WAL file.
//!
//! Owned exclusively by the buffer's serializer task; nothing else opens
//! the active file for writing.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Buffer size for file writes.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered appender over one log file.
pub struct LogFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl LogFileWriter {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            written,
        })
    }

    /// Appends one encoded record frame.
    pub fn append(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame)?;
        self.written += frame.len() as u64;
        Ok(())
    }

    /// Flushes buffered writes and makes them durable with fdatasync.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Bytes written to this file, including any content present when it
    /// was opened.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.written
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
