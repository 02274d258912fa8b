// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 The Tidelog Authors

//! The WAL append engine.
//!
//! Producers enqueue entries into a bounded channel and get back a
//! [`WalFlushListener`]. A single serializer task owns the active file: it
//! batches contiguous entries up to a size or delay threshold, writes and
//! fsyncs them as one unit, then completes every listener in the batch.
//! Roll signals travel in-band through the same queue, so a roll happens
//! exactly at its position in the write order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tidelog_core::{Result, WalConfig, WalError, NO_SEARCH_INDEX};

use crate::entry::{SignalKind, WalEntry, WalPayload};
use crate::layout;
use crate::writer::LogFileWriter;

/// Completion handle for one logged entry.
///
/// Resolves once the serializer has made the entry durable, or with the
/// failure that prevented it. Dropping the listener abandons the wait but
/// not the write.
pub struct WalFlushListener {
    rx: oneshot::Receiver<Result<()>>,
}

impl WalFlushListener {
    fn pair() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn failed(err: WalError) -> Self {
        let (tx, listener) = Self::pair();
        let _ = tx.send(Err(err));
        listener
    }

    /// Waits for the entry to become durable.
    ///
    /// # Errors
    ///
    /// Returns the write failure, or [`WalError::Closed`] when the buffer
    /// shut down before the entry was flushed.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(WalError::Closed),
        }
    }
}

struct QueuedEntry {
    entry: WalEntry,
    completion: oneshot::Sender<Result<()>>,
}

/// Buffered sequential writer for one WAL node directory.
pub struct WalBuffer {
    identifier: String,
    tx: Mutex<Option<mpsc::Sender<QueuedEntry>>>,
    serializer: Mutex<Option<JoinHandle<()>>>,
    current_version: Arc<AtomicU64>,
    flush_epoch: watch::Receiver<u64>,
}

impl WalBuffer {
    /// Opens the buffer over `dir`, resuming version numbering after any
    /// files left by a previous incarnation, and spawns the serializer.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned or the first
    /// log file cannot be created.
    pub fn open(identifier: &str, dir: &Path, config: Arc<WalConfig>) -> Result<Self> {
        let existing = layout::list_wal_files(dir)?;
        // never append to files of a previous incarnation; their tails may
        // be truncated
        let (version, last_search_index) = match existing.last() {
            Some(newest) => (newest.version + 1, recover_last_search_index(newest)),
            None => (0, NO_SEARCH_INDEX),
        };

        let first_path = dir.join(layout::file_name(version, last_search_index));
        let writer = LogFileWriter::open(&first_path)?;
        debug!(node = identifier, path = %first_path.display(), "opened wal file");

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (flush_tx, flush_rx) = watch::channel(0u64);
        let current_version = Arc::new(AtomicU64::new(version));

        let serializer = Serializer {
            identifier: identifier.to_string(),
            dir: dir.to_path_buf(),
            config,
            rx,
            writer,
            version: Arc::clone(&current_version),
            last_search_index,
            flush_tx,
            epoch: 0,
            batch: Vec::new(),
            batch_bytes: 0,
        };
        let handle = tokio::spawn(serializer.run());

        Ok(Self {
            identifier: identifier.to_string(),
            tx: Mutex::new(Some(tx)),
            serializer: Mutex::new(Some(handle)),
            current_version,
            flush_epoch: flush_rx,
        })
    }

    /// Enqueues an entry and returns its completion handle. Suspends only
    /// when the producer queue is full.
    ///
    /// Never fails directly: a buffer that is already closed resolves the
    /// listener with [`WalError::Closed`].
    pub async fn write(&self, entry: WalEntry) -> WalFlushListener {
        let sender = { self.tx.lock().await.clone() };
        let Some(sender) = sender else {
            return WalFlushListener::failed(WalError::Closed);
        };
        let (completion, listener) = WalFlushListener::pair();
        if sender.send(QueuedEntry { entry, completion }).await.is_err() {
            return WalFlushListener::failed(WalError::Closed);
        }
        listener
    }

    /// Version of the currently open file.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::SeqCst)
    }

    /// Blocks until the next successful flush boundary.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Closed`] if the buffer shuts down first.
    pub async fn wait_for_flush(&self) -> Result<()> {
        let mut rx = self.flush_epoch.clone();
        rx.borrow_and_update();
        rx.changed().await.map_err(|_| WalError::Closed)
    }

    /// Like [`Self::wait_for_flush`], returning `false` when `timeout`
    /// elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Closed`] if the buffer shuts down first.
    pub async fn wait_for_flush_timeout(&self, timeout: Duration) -> Result<bool> {
        let mut rx = self.flush_epoch.clone();
        rx.borrow_and_update();
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(WalError::Closed),
            Err(_) => Ok(false),
        }
    }

    /// Drains pending writes, fsyncs them and releases the file.
    ///
    /// Entries enqueued before the call complete normally; later `write`
    /// calls resolve their listeners with [`WalError::Closed`].
    pub async fn close(&self) {
        self.tx.lock().await.take();
        let handle = self.serializer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(node = %self.identifier, error = %e, "wal serializer task failed");
            }
        }
        info!(node = %self.identifier, "wal buffer closed");
    }
}

/// Recovers the highest search index present in a file left by a previous
/// incarnation. The name stamp is only a floor: entries written after the
/// file was opened may carry larger indexes, and the next file must not be
/// stamped below them.
fn recover_last_search_index(file: &layout::WalFileInfo) -> u64 {
    let mut last = file.start_search_index;
    let mut reader = match crate::reader::WalFileReader::open(&file.path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(path = %file.path.display(), error = %e, "failed to open wal file for recovery");
            return last;
        }
    };
    loop {
        match reader.next_entry() {
            Ok(Some(entry)) => last = last.max(entry.search_index()),
            Ok(None) => return last,
            Err(e) => {
                warn!(
                    path = %file.path.display(),
                    error = %e,
                    "stopped search index recovery at corrupt record"
                );
                return last;
            }
        }
    }
}

/// The single task that owns file descriptors and fsync.
struct Serializer {
    identifier: String,
    dir: PathBuf,
    config: Arc<WalConfig>,
    rx: mpsc::Receiver<QueuedEntry>,
    writer: LogFileWriter,
    version: Arc<AtomicU64>,
    /// Largest search index seen; names the next file on roll, since only
    /// the open group can carry this index across the roll.
    last_search_index: u64,
    flush_tx: watch::Sender<u64>,
    epoch: u64,
    batch: Vec<(Bytes, oneshot::Sender<Result<()>>)>,
    batch_bytes: u64,
}

impl Serializer {
    async fn run(mut self) {
        let delay = Duration::from_millis(self.config.fsync_delay_ms);
        loop {
            let next = if self.batch.is_empty() {
                self.rx.recv().await
            } else {
                tokio::select! {
                    queued = self.rx.recv() => queued,
                    _ = tokio::time::sleep(delay) => {
                        self.flush_batch();
                        continue;
                    }
                }
            };

            match next {
                Some(queued) => self.handle(queued),
                None => {
                    // all senders gone: drain finished, seal and exit
                    self.flush_batch();
                    if let Err(e) = self.writer.sync() {
                        error!(node = %self.identifier, error = %e, "failed to sync wal file on close");
                    }
                    return;
                }
            }
        }
    }

    fn handle(&mut self, queued: QueuedEntry) {
        if let WalPayload::Signal(SignalKind::RollFile { wait }) = queued.entry.payload {
            self.flush_batch();
            if wait {
                let result = self.roll().map_err(|e| WalError::Write(e.to_string()));
                let _ = queued.completion.send(result);
            } else {
                let _ = queued.completion.send(Ok(()));
                let result = self.roll().map_err(|e| WalError::Write(e.to_string()));
                if let Err(e) = result {
                    error!(node = %self.identifier, error = %e, "failed to roll wal file");
                }
            }
            return;
        }

        match queued.entry.encode() {
            Ok(frame) => {
                let index = queued.entry.search_index();
                if index != NO_SEARCH_INDEX {
                    self.last_search_index = self.last_search_index.max(index);
                }
                self.batch_bytes += frame.len() as u64;
                self.batch.push((frame, queued.completion));
                if self.batch.len() >= self.config.max_batch_entries
                    || self.batch_bytes >= self.config.max_batch_bytes
                {
                    self.flush_batch();
                }
            }
            Err(e) => {
                warn!(node = %self.identifier, error = %e, "dropping unencodable wal entry");
                let _ = queued.completion.send(Err(e));
            }
        }
    }

    /// Writes the batch, fsyncs, and completes its listeners. On failure
    /// every listener gets the cause and the serializer rolls to a fresh
    /// file before continuing.
    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        match self.write_and_sync() {
            Ok(()) => {
                self.epoch += 1;
                let _ = self.flush_tx.send(self.epoch);
                for (_, completion) in self.batch.drain(..) {
                    let _ = completion.send(Ok(()));
                }
                self.batch_bytes = 0;
                if self.writer.size() >= self.config.file_roll_size {
                    if let Err(e) = self.roll() {
                        error!(node = %self.identifier, error = %e, "failed to roll oversized wal file");
                    }
                }
            }
            Err(e) => {
                error!(node = %self.identifier, error = %e, "wal batch write failed");
                for (_, completion) in self.batch.drain(..) {
                    let _ = completion.send(Err(WalError::Write(e.to_string())));
                }
                self.batch_bytes = 0;
                if let Err(roll_err) = self.roll() {
                    error!(node = %self.identifier, error = %roll_err, "failed to roll wal file after write failure");
                }
            }
        }
    }

    fn write_and_sync(&mut self) -> std::io::Result<()> {
        for (frame, _) in &self.batch {
            self.writer.append(frame)?;
        }
        self.writer.sync()
    }

    /// Seals the current file and opens the next version.
    fn roll(&mut self) -> std::io::Result<()> {
        self.writer.sync()?;
        let next = self.version.load(Ordering::SeqCst) + 1;
        let path = self.dir.join(layout::file_name(next, self.last_search_index));
        let writer = LogFileWriter::open(&path)?;
        self.writer = writer;
        self.version.store(next, Ordering::SeqCst);
        debug!(node = %self.identifier, version = next, path = %path.display(), "rolled wal file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::entry::InsertRowPlan;
    use crate::reader::WalFileReader;

    use super::*;

    fn config() -> Arc<WalConfig> {
        Arc::new(WalConfig { fsync_delay_ms: 1, ..WalConfig::default() })
    }

    fn row(index: u64) -> WalEntry {
        WalEntry::insert_row(
            1,
            InsertRowPlan::new("root.sg.d1", Bytes::from_static(b"v")).with_search_index(index),
        )
    }

    #[tokio::test]
    async fn test_write_resolves_listener() {
        let dir = TempDir::new().unwrap();
        let buffer = WalBuffer::open("test", dir.path(), config()).unwrap();

        let listener = buffer.write(row(1)).await;
        listener.wait().await.unwrap();

        buffer.close().await;

        let files = layout::list_wal_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let mut reader = WalFileReader::open(&files[0].path).unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.search_index(), 1);
    }

    #[tokio::test]
    async fn test_roll_signal_advances_version() {
        let dir = TempDir::new().unwrap();
        let buffer = WalBuffer::open("test", dir.path(), config()).unwrap();
        assert_eq!(buffer.current_version(), 0);

        buffer.write(row(7)).await.wait().await.unwrap();
        let listener = buffer
            .write(WalEntry::signal(SignalKind::RollFile { wait: true }))
            .await;
        listener.wait().await.unwrap();
        assert_eq!(buffer.current_version(), 1);

        // the new file is stamped with the last seen search index
        let files = layout::list_wal_files(dir.path()).unwrap();
        let stamped: Vec<(u64, u64)> =
            files.iter().map(|f| (f.version, f.start_search_index)).collect();
        assert_eq!(stamped, vec![(0, 0), (1, 7)]);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_roll_by_size() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(WalConfig {
            file_roll_size: 64,
            fsync_delay_ms: 1,
            ..WalConfig::default()
        });
        let buffer = WalBuffer::open("test", dir.path(), config).unwrap();

        for index in 1..=3 {
            buffer.write(row(index)).await.wait().await.unwrap();
        }
        assert!(buffer.current_version() >= 1);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_restart_continues_version_numbering() {
        let dir = TempDir::new().unwrap();
        {
            let buffer = WalBuffer::open("test", dir.path(), config()).unwrap();
            buffer.write(row(5)).await.wait().await.unwrap();
            buffer.close().await;
        }

        let buffer = WalBuffer::open("test", dir.path(), config()).unwrap();
        assert_eq!(buffer.current_version(), 1);
        buffer.write(row(6)).await.wait().await.unwrap();
        buffer.close().await;

        let files = layout::list_wal_files(dir.path()).unwrap();
        let versions: Vec<u64> = files.iter().map(|f| f.version).collect();
        assert_eq!(versions, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_write_after_close_fails_listener() {
        let dir = TempDir::new().unwrap();
        let buffer = WalBuffer::open("test", dir.path(), config()).unwrap();
        buffer.close().await;

        let listener = buffer.write(row(1)).await;
        assert!(matches!(listener.wait().await, Err(WalError::Closed)));
    }

    #[tokio::test]
    async fn test_wait_for_flush_timeout_with_no_writes() {
        let dir = TempDir::new().unwrap();
        let buffer = WalBuffer::open("test", dir.path(), config()).unwrap();

        let flushed = buffer
            .wait_for_flush_timeout(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!flushed);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_wait_for_flush_wakes_on_write() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(WalBuffer::open("test", dir.path(), config()).unwrap());

        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_for_flush().await })
        };
        // give the waiter time to park before the write lands
        tokio::time::sleep(Duration::from_millis(10)).await;

        buffer.write(row(1)).await.wait().await.unwrap();
        waiter.await.unwrap().unwrap();

        buffer.close().await;
    }
}
