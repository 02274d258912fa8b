// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 The Tidelog Authors

//! The WAL node: public façade over the buffer, checkpoints and search.
//!
//! One node serves one region. Mutations are logged here before they touch
//! in-memory tables; the storage engine reports memtable lifecycles back
//! through [`WalNode::on_memtable_created`] and
//! [`WalNode::on_memtable_flushed`]; consensus consumers replay logical
//! writes through the search API; and a periodically scheduled reclaimer
//! ([`WalNode::delete_outdated_files`]) releases disk space, leaning on
//! the storage engine to snapshot or flush when too little of the log
//! still describes un-flushed data.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use tidelog_core::{
    FlushStatus, MemTableId, Result, WalConfig, DEFAULT_SAFELY_DELETED_SEARCH_INDEX,
};

use crate::buffer::{WalBuffer, WalFlushListener};
use crate::checkpoint::{CheckpointManager, MemTableInfo};
use crate::engine::StorageEngine;
use crate::entry::{DeletePlan, InsertRowPlan, InsertTabletPlan, SignalKind, WalEntry};
use crate::layout;
use crate::search::{self, ReplayRequest, WalRequestIterator};

/// How long the reclaimer waits for a requested memtable flush. Deleting
/// files is not urgent, so giving up is fine; reclamation retries on its
/// next schedule.
const FLUSH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a requested flush.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A per-region durable log with consensus replay support.
///
/// If search is used, the upper layer protects the order of search
/// indexes, and values start from 1.
pub struct WalNode {
    identifier: String,
    dir: PathBuf,
    config: Arc<WalConfig>,
    buffer: Arc<WalBuffer>,
    checkpoint: CheckpointManager,
    engine: Arc<dyn StorageEngine>,
    /// How many times each memtable has been snapshotted, capping the
    /// write amplification of repeated snapshots.
    snapshot_counts: DashMap<MemTableId, u32>,
    /// Cost contributed by memtables whose flush confirmation arrived
    /// while the keyed file version was current.
    flushed_cost_by_version: DashMap<u64, u64>,
    total_flushed_cost: AtomicU64,
    /// No consumer needs entries with a search index strictly below this.
    safely_deleted_search_index: AtomicU64,
}

impl WalNode {
    /// Opens a WAL node over `dir`, creating the directory if needed.
    ///
    /// Must be called within a Tokio runtime; the buffer spawns its
    /// serializer task.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or the first log file cannot be
    /// created.
    pub fn open(
        identifier: &str,
        dir: &Path,
        config: Arc<WalConfig>,
        engine: Arc<dyn StorageEngine>,
    ) -> Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            info!(node = identifier, dir = %dir.display(), "created wal node directory");
        }
        let buffer = Arc::new(WalBuffer::open(identifier, dir, Arc::clone(&config))?);
        Ok(Self {
            identifier: identifier.to_string(),
            dir: dir.to_path_buf(),
            config,
            buffer,
            checkpoint: CheckpointManager::new(),
            engine,
            snapshot_counts: DashMap::new(),
            flushed_cost_by_version: DashMap::new(),
            total_flushed_cost: AtomicU64::new(0),
            safely_deleted_search_index: AtomicU64::new(DEFAULT_SAFELY_DELETED_SEARCH_INDEX),
        })
    }

    /// Unique identifier of this node.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Directory holding this node's files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Version of the currently open log file.
    #[must_use]
    pub fn current_file_version(&self) -> u64 {
        self.buffer.current_version()
    }

    /// The live-memtable registry.
    #[must_use]
    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    /// Logs a row insert.
    pub async fn log_insert_row(
        &self,
        memtable_id: MemTableId,
        plan: InsertRowPlan,
    ) -> WalFlushListener {
        self.adopt_watermark_hint(plan.safely_deleted_search_index);
        self.buffer.write(WalEntry::insert_row(memtable_id, plan)).await
    }

    /// Logs a tablet insert, possibly one slice of a larger tablet.
    pub async fn log_insert_tablet(
        &self,
        memtable_id: MemTableId,
        plan: InsertTabletPlan,
    ) -> WalFlushListener {
        self.adopt_watermark_hint(plan.safely_deleted_search_index);
        self.buffer.write(WalEntry::insert_tablet(memtable_id, plan)).await
    }

    /// Logs a deletion.
    pub async fn log_delete(
        &self,
        memtable_id: MemTableId,
        plan: DeletePlan,
    ) -> WalFlushListener {
        self.buffer.write(WalEntry::delete(memtable_id, plan)).await
    }

    /// Logs a full snapshot of a memtable's current contents.
    pub async fn log_memtable_snapshot(
        &self,
        memtable_id: MemTableId,
        contents: Bytes,
    ) -> WalFlushListener {
        self.buffer.write(WalEntry::memtable_snapshot(memtable_id, contents)).await
    }

    fn adopt_watermark_hint(&self, hint: u64) {
        if hint != DEFAULT_SAFELY_DELETED_SEARCH_INDEX {
            self.set_safely_deleted_search_index(hint);
        }
    }

    /// Registers a newly created memtable; its liveness pins the current
    /// file version and everything after it.
    pub async fn on_memtable_created(&self, memtable_id: MemTableId, tsfile: &Path) {
        let cost = self.memtable_cost(memtable_id).await;
        self.checkpoint.register_memtable(MemTableInfo::new(
            memtable_id,
            tsfile,
            self.buffer.current_version(),
            cost,
        ));
    }

    /// Confirms a memtable flush, moving its cost from the active side of
    /// the effective-information ratio to the flushed side. Idempotent.
    pub async fn on_memtable_flushed(&self, memtable_id: MemTableId) {
        let Some(_info) = self.checkpoint.flush_memtable(memtable_id) else {
            return;
        };
        self.snapshot_counts.remove(&memtable_id);
        let cost = self.memtable_cost(memtable_id).await;
        let version = self.buffer.current_version();
        *self.flushed_cost_by_version.entry(version).or_insert(0) += cost;
        self.total_flushed_cost.fetch_add(cost, Ordering::SeqCst);
    }

    async fn memtable_cost(&self, memtable_id: MemTableId) -> u64 {
        if self.config.enable_mem_control {
            self.engine.memtable_cost(memtable_id).await
        } else {
            1
        }
    }

    /// Adopts a new replay watermark: entries with a search index strictly
    /// below it are no longer needed by any consumer.
    ///
    /// The first call replaces the "not serving replay" sentinel; from
    /// then on the watermark only moves forward, so stale or duplicate
    /// calls are no-ops.
    pub fn set_safely_deleted_search_index(&self, index: u64) {
        let mut current = self.safely_deleted_search_index.load(Ordering::SeqCst);
        loop {
            let target = if current == DEFAULT_SAFELY_DELETED_SEARCH_INDEX {
                index
            } else {
                current.max(index)
            };
            if target == current {
                return;
            }
            match self.safely_deleted_search_index.compare_exchange(
                current,
                target,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// The current replay watermark.
    #[must_use]
    pub fn safely_deleted_search_index(&self) -> u64 {
        self.safely_deleted_search_index.load(Ordering::SeqCst)
    }

    /// Reconstructs the logical write with the given search index from
    /// durable files, merging entries that share the index. Returns `None`
    /// when nothing durable carries it.
    #[must_use]
    pub fn get_req(&self, index: u64) -> Option<ReplayRequest> {
        search::find_requests(&self.dir, index, 1).into_iter().next()
    }

    /// Reconstructs up to `count` consecutive logical writes starting at
    /// `start`.
    #[must_use]
    pub fn get_reqs(&self, start: u64, count: usize) -> Vec<ReplayRequest> {
        search::find_requests(&self.dir, start, count)
    }

    /// A resumable cursor over logical writes starting at `start`, for
    /// followers catching up. The cursor must stay on one task.
    #[must_use]
    pub fn req_iterator(&self, start: u64) -> WalRequestIterator {
        WalRequestIterator::new(
            self.identifier.clone(),
            self.dir.clone(),
            Arc::clone(&self.buffer),
            start,
        )
    }

    /// Emits a roll signal and waits for the new file to be open, so
    /// `current_file_version` advances atomically with respect to the
    /// write order. Failure is logged; the log keeps running on the old
    /// file.
    pub async fn roll_wal_file(&self) {
        let listener = self
            .buffer
            .write(WalEntry::signal(SignalKind::RollFile { wait: true }))
            .await;
        if let Err(e) = listener.wait().await {
            error!(node = %self.identifier, error = %e, "failed to roll wal file");
        }
    }

    /// Deletes outdated log files and, when too little of the log still
    /// describes un-flushed data, asks the storage engine to snapshot or
    /// flush the oldest live memtable and deletes again.
    ///
    /// Designed to be scheduler-invoked; errors are logged, never raised,
    /// and the next run retries.
    pub async fn delete_outdated_files(&self) {
        if let Err(e) = self.reclaim().await {
            error!(node = %self.identifier, error = %e, "failed to delete outdated wal files");
        }
    }

    async fn reclaim(&self) -> Result<()> {
        let mut previous_state = None;
        loop {
            let first_valid = match self.checkpoint.first_valid_wal_version() {
                Some(version) => version,
                None => {
                    // no live memtable pins anything; roll so the current
                    // file becomes deletable too
                    self.roll_wal_file().await;
                    match self.checkpoint.first_valid_wal_version() {
                        Some(version) => version,
                        None => self.buffer.current_version(),
                    }
                }
            };
            self.delete_files_below(first_valid)?;

            // once consensus manages the watermark, files above it are
            // pinned by replay needs and snapshotting cannot release them
            if self.safely_deleted_search_index() != DEFAULT_SAFELY_DELETED_SEARCH_INDEX {
                return Ok(());
            }

            self.refresh_active_costs().await;
            let active = self.checkpoint.total_active_cost();
            let flushed = self.total_flushed_cost.load(Ordering::SeqCst);
            if active + flushed == 0 {
                return Ok(());
            }
            let ratio = active as f64 / (active + flushed) as f64;
            debug!(
                node = %self.identifier,
                ratio,
                active_cost = active,
                flushed_cost = flushed,
                "computed effective information ratio"
            );
            if ratio >= self.config.min_effective_info_ratio {
                return Ok(());
            }
            // a flush whose confirmation callback has not arrived yet, or
            // a failed snapshot, changes nothing observable; stop instead
            // of spinning and let the next scheduled run retry
            let state = (first_valid, active, flushed, self.checkpoint.memtable_ids());
            if previous_state.as_ref() == Some(&state) {
                warn!(node = %self.identifier, "reclamation made no progress, retrying next run");
                return Ok(());
            }
            previous_state = Some(state);

            info!(
                node = %self.identifier,
                ratio,
                min = self.config.min_effective_info_ratio,
                "effective information ratio too low, snapshotting or flushing the oldest memtable"
            );
            if !self.snapshot_or_flush_oldest().await {
                return Ok(());
            }
        }
    }

    /// Deletes every file older than `first_valid` whose start search
    /// index sits below the replay watermark, settling the flushed-cost
    /// ledger for each removed version.
    fn delete_files_below(&self, first_valid: u64) -> Result<()> {
        let watermark = self.safely_deleted_search_index();
        for file in layout::list_wal_files(&self.dir)? {
            if file.version >= first_valid || file.start_search_index >= watermark {
                continue;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    debug!(node = %self.identifier, path = %file.path.display(), "deleted outdated wal file");
                    if let Some((_, cost)) = self.flushed_cost_by_version.remove(&file.version) {
                        self.total_flushed_cost.fetch_sub(cost, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    info!(
                        node = %self.identifier,
                        path = %file.path.display(),
                        error = %e,
                        "failed to delete outdated wal file"
                    );
                }
            }
        }
        Ok(())
    }

    /// Re-reads live memtable costs from the engine so the ratio reflects
    /// current RAM footprints, not registration-time ones.
    async fn refresh_active_costs(&self) {
        if !self.config.enable_mem_control {
            return;
        }
        for memtable_id in self.checkpoint.memtable_ids() {
            let cost = self.engine.memtable_cost(memtable_id).await;
            self.checkpoint.update_cost(memtable_id, cost);
        }
    }

    /// Picks the oldest live memtable and either flushes it (snapshot cap
    /// reached, or too big to keep copying) or snapshots it into a fresh
    /// file. Returns false when there is nothing to work on.
    async fn snapshot_or_flush_oldest(&self) -> bool {
        let Some(oldest) = self.checkpoint.oldest_memtable() else {
            return false;
        };
        let cost = self.memtable_cost(oldest.memtable_id).await;
        let snapshots = self
            .snapshot_counts
            .get(&oldest.memtable_id)
            .map_or(0, |count| *count);
        if snapshots >= self.config.max_memtable_snapshot_num
            || cost > self.config.memtable_snapshot_threshold
        {
            self.flush_memtable(&oldest).await;
        } else {
            self.snapshot_memtable(&oldest).await;
        }
        true
    }

    /// Requests a flush of the memtable's time partition and waits,
    /// bounded, for it to finish. Timing out is non-fatal.
    async fn flush_memtable(&self, info: &MemTableInfo) {
        let mut should_wait = true;
        if self.engine.flush_status(info.memtable_id).await == FlushStatus::Working {
            should_wait = self.engine.submit_flush(&info.tsfile_path).await;
            info!(
                node = %self.identifier,
                memtable = info.memtable_id,
                tsfile = %info.tsfile_path.display(),
                "requested flush of the oldest memtable"
            );
        }
        if !should_wait {
            return;
        }
        let mut waited = Duration::ZERO;
        while self.engine.flush_status(info.memtable_id).await != FlushStatus::Flushed {
            if waited >= FLUSH_WAIT_TIMEOUT {
                warn!(
                    node = %self.identifier,
                    memtable = info.memtable_id,
                    "waiting too long for memtable flush"
                );
                return;
            }
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
            waited += FLUSH_POLL_INTERVAL;
        }
    }

    /// Rewrites the memtable's current contents as one snapshot entry in a
    /// fresh file, then advances its first valid version past every older
    /// file. On failure the memtable stays pinned at its prior version and
    /// the next reclamation retries.
    async fn snapshot_memtable(&self, info: &MemTableInfo) {
        let memtable_id = info.memtable_id;
        *self.snapshot_counts.entry(memtable_id).or_insert(0) += 1;

        // roll first so the snapshot lands in a file newer than every file
        // holding the memtable's original inserts
        let listener = self
            .buffer
            .write(WalEntry::signal(SignalKind::RollFile { wait: true }))
            .await;
        if let Err(e) = listener.wait().await {
            error!(node = %self.identifier, error = %e, "failed to roll wal file before snapshot");
            return;
        }
        let snapshot_version = self.buffer.current_version();

        // pause region writes so the capture is consistent; blocking
        // writers briefly is low-risk since this memtable accumulates
        // slowly
        self.engine.write_lock("wal-snapshot").await;
        let contents = self.engine.snapshot_memtable(memtable_id).await;
        let outcome = match contents {
            Some(contents) => {
                let listener = self.log_memtable_snapshot(memtable_id, contents).await;
                Some(listener.wait().await)
            }
            None => None,
        };
        self.engine.write_unlock().await;

        match outcome {
            Some(Ok(())) => {
                self.checkpoint.set_first_file_version(memtable_id, snapshot_version);
                info!(
                    node = %self.identifier,
                    memtable = memtable_id,
                    version = snapshot_version,
                    "snapshotted memtable into the wal"
                );
            }
            Some(Err(e)) => {
                error!(
                    node = %self.identifier,
                    memtable = memtable_id,
                    error = %e,
                    "failed to snapshot memtable into the wal"
                );
            }
            None => {
                warn!(
                    node = %self.identifier,
                    memtable = memtable_id,
                    "memtable disappeared before snapshot"
                );
            }
        }
    }

    /// Closes the buffer (draining pending writes) and the checkpoint
    /// registry.
    pub async fn close(&self) {
        self.buffer.close().await;
        self.checkpoint.close();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::entry::InsertRowPlan;
    use crate::testing::FakeStorageEngine;

    use super::*;

    fn config() -> Arc<WalConfig> {
        Arc::new(WalConfig { fsync_delay_ms: 1, ..WalConfig::default() })
    }

    fn node_with_engine(
        dir: &Path,
        config: Arc<WalConfig>,
    ) -> (WalNode, Arc<FakeStorageEngine>) {
        let engine = Arc::new(FakeStorageEngine::new());
        let node =
            WalNode::open("region-1", dir, config, Arc::clone(&engine) as Arc<dyn StorageEngine>)
                .unwrap();
        (node, engine)
    }

    fn row(index: u64) -> InsertRowPlan {
        InsertRowPlan::new("root.sg.d1", Bytes::from_static(b"v")).with_search_index(index)
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic_after_first_set() {
        let dir = TempDir::new().unwrap();
        let (node, _engine) = node_with_engine(dir.path(), config());

        assert_eq!(
            node.safely_deleted_search_index(),
            DEFAULT_SAFELY_DELETED_SEARCH_INDEX
        );
        node.set_safely_deleted_search_index(100);
        assert_eq!(node.safely_deleted_search_index(), 100);
        node.set_safely_deleted_search_index(40);
        assert_eq!(node.safely_deleted_search_index(), 100);
        node.set_safely_deleted_search_index(250);
        assert_eq!(node.safely_deleted_search_index(), 250);

        node.close().await;
    }

    #[tokio::test]
    async fn test_insert_hint_adopts_watermark() {
        let dir = TempDir::new().unwrap();
        let (node, _engine) = node_with_engine(dir.path(), config());

        let plan = row(5).with_safely_deleted_search_index(3);
        node.log_insert_row(1, plan).await.wait().await.unwrap();
        assert_eq!(node.safely_deleted_search_index(), 3);

        // hint-less inserts leave the watermark alone
        node.log_insert_row(1, row(6)).await.wait().await.unwrap();
        assert_eq!(node.safely_deleted_search_index(), 3);

        node.close().await;
    }

    #[tokio::test]
    async fn test_flushed_cost_moves_to_ledger_once() {
        let dir = TempDir::new().unwrap();
        let (node, engine) = node_with_engine(dir.path(), config());
        engine.add_memtable(1, 500, b"contents");

        node.on_memtable_created(1, Path::new("/data/seq/100.tsfile")).await;
        assert_eq!(node.checkpoint_manager().total_active_cost(), 500);

        node.on_memtable_flushed(1).await;
        node.on_memtable_flushed(1).await; // idempotent
        assert_eq!(node.checkpoint_manager().total_active_cost(), 0);
        assert_eq!(node.total_flushed_cost.load(Ordering::SeqCst), 500);

        node.close().await;
    }

    #[tokio::test]
    async fn test_reclaimer_deletes_files_behind_flushed_memtables() {
        let dir = TempDir::new().unwrap();
        let (node, engine) = node_with_engine(dir.path(), config());
        engine.add_memtable(1, 10, b"contents");

        let old_version = node.current_file_version();
        node.on_memtable_created(1, Path::new("/data/seq/100.tsfile")).await;
        for index in 1..=10 {
            node.log_insert_row(1, row(index)).await.wait().await.unwrap();
        }
        node.roll_wal_file().await;
        node.on_memtable_flushed(1).await;

        node.set_safely_deleted_search_index(u64::MAX);
        node.delete_outdated_files().await;

        let files = layout::list_wal_files(dir.path()).unwrap();
        assert!(files.iter().all(|f| f.version != old_version));
        let current = node.current_file_version();
        assert!(files.iter().any(|f| f.version == current));

        node.close().await;
    }

    #[tokio::test]
    async fn test_reclaimer_keeps_files_pinned_by_watermark() {
        let dir = TempDir::new().unwrap();
        let (node, engine) = node_with_engine(dir.path(), config());
        engine.add_memtable(1, 10, b"contents");

        node.on_memtable_created(1, Path::new("/data/seq/100.tsfile")).await;
        node.log_insert_row(1, row(5)).await.wait().await.unwrap();
        node.roll_wal_file().await; // second file starts at index 5
        node.log_insert_row(1, row(6)).await.wait().await.unwrap();
        node.roll_wal_file().await;
        node.on_memtable_flushed(1).await;

        // replay still needs index 3 and beyond: the first file (start 0)
        // goes, the file starting at 5 stays despite its age
        node.set_safely_deleted_search_index(3);
        node.delete_outdated_files().await;

        let starts: Vec<u64> = layout::list_wal_files(dir.path())
            .unwrap()
            .iter()
            .map(|f| f.start_search_index)
            .collect();
        assert!(!starts.contains(&0));
        assert!(starts.contains(&5));

        node.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_count_cap_forces_flush() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(WalConfig {
            fsync_delay_ms: 1,
            max_memtable_snapshot_num: 0,
            ..WalConfig::default()
        });
        let (node, engine) = node_with_engine(dir.path(), config);
        engine.add_memtable(1, 1, b"tiny");
        node.on_memtable_created(1, Path::new("/data/seq/100.tsfile")).await;

        // make the flushed side dominate so the ratio trips
        engine.add_memtable(2, 10_000, b"big");
        node.on_memtable_created(2, Path::new("/data/seq/101.tsfile")).await;
        node.on_memtable_flushed(2).await;

        node.delete_outdated_files().await;

        // snapshot cap of zero means the engine is asked to flush instead
        assert_eq!(engine.submitted_flushes().len(), 1);

        node.close().await;
    }
}
