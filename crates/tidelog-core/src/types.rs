//! Identifier and status types shared with the storage engine.

use serde::{Deserialize, Serialize};

/// Identifier of an in-memory table. The storage engine allocates these
/// from a global counter, so larger ids belong to younger memtables.
pub type MemTableId = u64;

/// Search index value meaning "no consensus index assigned". Real search
/// indexes start from 1.
pub const NO_SEARCH_INDEX: u64 = 0;

/// Initial watermark of `safely_deleted_search_index`: the log is not
/// serving consensus replay and every entry may be reclaimed as soon as
/// its memtables have flushed. Consensus deployments replace it with a
/// real watermark, after which the watermark only moves forward.
pub const DEFAULT_SAFELY_DELETED_SEARCH_INDEX: u64 = u64::MAX;

/// Flush state of a memtable, as reported by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushStatus {
    /// Accepting writes.
    Working,
    /// A flush task is running.
    Flushing,
    /// Durably written to its TsFile.
    Flushed,
}
