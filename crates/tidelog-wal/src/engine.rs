//! Outbound capability port to the owning storage engine.
//!
//! The WAL node never holds the engine itself, only this capability,
//! injected at construction. The reclaimer uses it to close the loop that
//! turns low effective information into flushed or snapshotted memtables.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use tidelog_core::{FlushStatus, MemTableId};

/// Capabilities the WAL node requires from the storage engine that owns
/// its region.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Asks the engine to flush the time partition that owns `tsfile`.
    /// Returns `false` when no flush task was scheduled and there is
    /// nothing to wait for.
    async fn submit_flush(&self, tsfile: &Path) -> bool;

    /// Current flush state of a memtable. Unknown memtables report
    /// [`FlushStatus::Flushed`].
    async fn flush_status(&self, memtable_id: MemTableId) -> FlushStatus;

    /// Approximate RAM footprint of a memtable, in bytes. Must remain
    /// answerable until the engine's flush confirmation callback for that
    /// memtable returns.
    async fn memtable_cost(&self, memtable_id: MemTableId) -> u64;

    /// Blocks new writes to the region until [`Self::write_unlock`].
    async fn write_lock(&self, reason: &str);

    /// Releases the region write lock.
    async fn write_unlock(&self);

    /// Serializes the current contents of a live memtable, or `None` when
    /// it no longer exists. Called under the region write lock so the
    /// capture is consistent.
    async fn snapshot_memtable(&self, memtable_id: MemTableId) -> Option<Bytes>;
}
