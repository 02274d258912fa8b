//! Test doubles for the storage-engine port.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use tidelog_core::{FlushStatus, MemTableId};

use crate::engine::StorageEngine;

#[derive(Debug, Clone)]
struct FakeMemTable {
    cost: u64,
    status: FlushStatus,
    contents: Bytes,
}

/// In-memory [`StorageEngine`] for tests.
///
/// Memtables are plain records; `submit_flush` marks every working
/// memtable flushed immediately unless [`FakeStorageEngine::hold_flushes`]
/// is set.
#[derive(Debug, Default)]
pub struct FakeStorageEngine {
    memtables: DashMap<MemTableId, FakeMemTable>,
    submitted_flushes: Mutex<Vec<PathBuf>>,
    hold_flushes: AtomicBool,
    write_locks: AtomicU32,
}

impl FakeStorageEngine {
    /// Creates an engine with no memtables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a working memtable.
    pub fn add_memtable(&self, memtable_id: MemTableId, cost: u64, contents: &[u8]) {
        self.memtables.insert(
            memtable_id,
            FakeMemTable {
                cost,
                status: FlushStatus::Working,
                contents: Bytes::copy_from_slice(contents),
            },
        );
    }

    /// Overrides a memtable's flush status.
    pub fn set_status(&self, memtable_id: MemTableId, status: FlushStatus) {
        if let Some(mut memtable) = self.memtables.get_mut(&memtable_id) {
            memtable.status = status;
        }
    }

    /// Overrides a memtable's cost.
    pub fn set_cost(&self, memtable_id: MemTableId, cost: u64) {
        if let Some(mut memtable) = self.memtables.get_mut(&memtable_id) {
            memtable.cost = cost;
        }
    }

    /// When set, `submit_flush` schedules but never completes, leaving
    /// memtables in [`FlushStatus::Flushing`].
    pub fn hold_flushes(&self, hold: bool) {
        self.hold_flushes.store(hold, Ordering::SeqCst);
    }

    /// TsFiles passed to `submit_flush`, in call order.
    #[must_use]
    pub fn submitted_flushes(&self) -> Vec<PathBuf> {
        self.submitted_flushes.lock().clone()
    }

    /// Balance of `write_lock` minus `write_unlock` calls.
    #[must_use]
    pub fn write_lock_balance(&self) -> u32 {
        self.write_locks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageEngine for FakeStorageEngine {
    async fn submit_flush(&self, tsfile: &Path) -> bool {
        self.submitted_flushes.lock().push(tsfile.to_path_buf());
        let target = if self.hold_flushes.load(Ordering::SeqCst) {
            FlushStatus::Flushing
        } else {
            FlushStatus::Flushed
        };
        for mut memtable in self.memtables.iter_mut() {
            if memtable.status == FlushStatus::Working {
                memtable.status = target;
            }
        }
        true
    }

    async fn flush_status(&self, memtable_id: MemTableId) -> FlushStatus {
        self.memtables
            .get(&memtable_id)
            .map_or(FlushStatus::Flushed, |memtable| memtable.status)
    }

    async fn memtable_cost(&self, memtable_id: MemTableId) -> u64 {
        self.memtables.get(&memtable_id).map_or(0, |memtable| memtable.cost)
    }

    async fn write_lock(&self, _reason: &str) {
        self.write_locks.fetch_add(1, Ordering::SeqCst);
    }

    async fn write_unlock(&self) {
        self.write_locks.fetch_sub(1, Ordering::SeqCst);
    }

    async fn snapshot_memtable(&self, memtable_id: MemTableId) -> Option<Bytes> {
        self.memtables.get(&memtable_id).map(|memtable| memtable.contents.clone())
    }
}
