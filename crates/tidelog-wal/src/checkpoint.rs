//! Live-memtable bookkeeping behind WAL file reclamation.
//!
//! Every memtable registers here when created and leaves when its flush is
//! confirmed. The minimum `first_file_version` over the live set is the
//! oldest log file the node still needs; everything older is reclaimable
//! (subject to the replay watermark).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use tidelog_core::MemTableId;

/// Liveness record of one memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemTableInfo {
    /// Id of the memtable.
    pub memtable_id: MemTableId,
    /// TsFile this memtable will flush into.
    pub tsfile_path: PathBuf,
    /// Oldest WAL file version still holding this memtable's data, either
    /// its original inserts or a snapshot. Advances when a snapshot is
    /// rewritten into a newer file.
    pub first_file_version: u64,
    /// Approximate cost of the un-flushed data this memtable represents.
    pub cost: u64,
}

impl MemTableInfo {
    /// Creates a liveness record.
    pub fn new(
        memtable_id: MemTableId,
        tsfile_path: &Path,
        first_file_version: u64,
        cost: u64,
    ) -> Self {
        Self {
            memtable_id,
            tsfile_path: tsfile_path.to_path_buf(),
            first_file_version,
            cost,
        }
    }
}

/// Registry of live memtables for one WAL node.
///
/// Safe under concurrent readers and one mutator; the map is guarded by a
/// single mutex and critical sections stay short. Keys are memtable ids,
/// which the storage engine allocates monotonically, so the smallest key
/// is the oldest registration.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    live: Mutex<BTreeMap<MemTableId, MemTableInfo>>,
}

impl CheckpointManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly created memtable.
    pub fn register_memtable(&self, info: MemTableInfo) {
        let mut live = self.live.lock();
        if let Some(previous) = live.insert(info.memtable_id, info) {
            warn!(
                memtable = previous.memtable_id,
                "memtable registered twice, replacing the earlier registration"
            );
        }
    }

    /// Removes a memtable whose flush was confirmed. Returns its record,
    /// or `None` when it was already removed; calling twice is equivalent
    /// to calling once.
    pub fn flush_memtable(&self, memtable_id: MemTableId) -> Option<MemTableInfo> {
        self.live.lock().remove(&memtable_id)
    }

    /// Advances a memtable's first file version after its snapshot landed
    /// in a newer file. Decreases are rejected. Returns whether the value
    /// was applied.
    pub fn set_first_file_version(&self, memtable_id: MemTableId, version: u64) -> bool {
        let mut live = self.live.lock();
        let Some(info) = live.get_mut(&memtable_id) else {
            return false;
        };
        if version < info.first_file_version {
            warn!(
                memtable = memtable_id,
                current = info.first_file_version,
                requested = version,
                "rejecting first-file-version decrease"
            );
            return false;
        }
        info.first_file_version = version;
        true
    }

    /// Refreshes a memtable's cost estimate.
    pub fn update_cost(&self, memtable_id: MemTableId, cost: u64) {
        if let Some(info) = self.live.lock().get_mut(&memtable_id) {
            info.cost = cost;
        }
    }

    /// The oldest live memtable, if any.
    #[must_use]
    pub fn oldest_memtable(&self) -> Option<MemTableInfo> {
        self.live.lock().values().next().cloned()
    }

    /// Ids of every live memtable, oldest first.
    #[must_use]
    pub fn memtable_ids(&self) -> Vec<MemTableId> {
        self.live.lock().keys().copied().collect()
    }

    /// Looks up one memtable's record.
    #[must_use]
    pub fn memtable_info(&self, memtable_id: MemTableId) -> Option<MemTableInfo> {
        self.live.lock().get(&memtable_id).cloned()
    }

    /// Minimum first file version over the live set; `None` when no
    /// memtable is live and every file is reclaimable.
    #[must_use]
    pub fn first_valid_wal_version(&self) -> Option<u64> {
        self.live.lock().values().map(|info| info.first_file_version).min()
    }

    /// Total cost of un-flushed data across live memtables.
    #[must_use]
    pub fn total_active_cost(&self) -> u64 {
        self.live.lock().values().map(|info| info.cost).sum()
    }

    /// Drops all registrations.
    pub fn close(&self) {
        self.live.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: MemTableId, version: u64, cost: u64) -> MemTableInfo {
        MemTableInfo::new(id, Path::new("/data/seq/sg1/0/100-1-0-0.tsfile"), version, cost)
    }

    #[test]
    fn test_first_valid_version_is_min_over_live() {
        let manager = CheckpointManager::new();
        assert_eq!(manager.first_valid_wal_version(), None);

        manager.register_memtable(info(1, 4, 10));
        manager.register_memtable(info(2, 2, 10));
        manager.register_memtable(info(3, 9, 10));
        assert_eq!(manager.first_valid_wal_version(), Some(2));

        manager.flush_memtable(2);
        assert_eq!(manager.first_valid_wal_version(), Some(4));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let manager = CheckpointManager::new();
        manager.register_memtable(info(5, 0, 7));

        assert!(manager.flush_memtable(5).is_some());
        assert!(manager.flush_memtable(5).is_none());
        assert_eq!(manager.total_active_cost(), 0);
    }

    #[test]
    fn test_set_first_file_version_is_monotonic() {
        let manager = CheckpointManager::new();
        manager.register_memtable(info(1, 3, 1));

        assert!(manager.set_first_file_version(1, 6));
        assert!(!manager.set_first_file_version(1, 4));
        assert_eq!(manager.memtable_info(1).unwrap().first_file_version, 6);

        assert!(!manager.set_first_file_version(99, 1));
    }

    #[test]
    fn test_oldest_is_smallest_id() {
        let manager = CheckpointManager::new();
        manager.register_memtable(info(12, 0, 1));
        manager.register_memtable(info(7, 1, 1));

        assert_eq!(manager.oldest_memtable().unwrap().memtable_id, 7);
        manager.flush_memtable(7);
        assert_eq!(manager.oldest_memtable().unwrap().memtable_id, 12);
    }

    #[test]
    fn test_cost_accounting() {
        let manager = CheckpointManager::new();
        manager.register_memtable(info(1, 0, 100));
        manager.register_memtable(info(2, 0, 50));
        assert_eq!(manager.total_active_cost(), 150);

        manager.update_cost(1, 400);
        assert_eq!(manager.total_active_cost(), 450);
    }
}
