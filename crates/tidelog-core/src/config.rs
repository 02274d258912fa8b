//! Configuration for the WAL node.

use serde::{Deserialize, Serialize};

/// Tunables for a WAL node.
///
/// Every field has a default, so partial TOML files work:
///
/// ```
/// use tidelog_core::WalConfig;
///
/// let config = WalConfig::parse("file_roll_size = 1048576").unwrap();
/// assert_eq!(config.file_roll_size, 1024 * 1024);
/// assert_eq!(config.min_effective_info_ratio, 0.1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Reclaimer threshold on `active / (active + flushed)` cost. Below it,
    /// the oldest live memtable is snapshotted or flushed to release old
    /// log files.
    pub min_effective_info_ratio: f64,

    /// How often one memtable may be snapshotted into the log before the
    /// reclaimer forces a flush instead, capping write amplification.
    pub max_memtable_snapshot_num: u32,

    /// Memtable cost (bytes) above which snapshotting is skipped in favor
    /// of a flush.
    pub memtable_snapshot_threshold: u64,

    /// When true, memtable cost is its RAM footprint in bytes; otherwise
    /// each memtable counts as 1.
    pub enable_mem_control: bool,

    /// File size (bytes) at which the serializer rolls to a new log file.
    pub file_roll_size: u64,

    /// Maximum entries batched into a single fsync.
    pub max_batch_entries: usize,

    /// Maximum bytes batched into a single fsync.
    pub max_batch_bytes: u64,

    /// Maximum delay before a partial batch is fsynced (milliseconds).
    pub fsync_delay_ms: u64,

    /// Capacity of the producer queue; `log` calls block once it fills.
    pub queue_capacity: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            min_effective_info_ratio: 0.1,
            max_memtable_snapshot_num: 1,
            memtable_snapshot_threshold: 8 * 1024 * 1024,
            enable_mem_control: true,
            file_roll_size: 10 * 1024 * 1024,
            max_batch_entries: 64,
            max_batch_bytes: 16 * 1024 * 1024,
            fsync_delay_ms: 10,
            queue_capacity: 1024,
        }
    }
}

impl WalConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::WalError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::WalError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WalConfig::default();
        assert_eq!(config.min_effective_info_ratio, 0.1);
        assert_eq!(config.max_memtable_snapshot_num, 1);
        assert!(config.enable_mem_control);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_parse_partial() {
        let config = WalConfig::parse(
            "enable_mem_control = false\nmax_memtable_snapshot_num = 3",
        )
        .unwrap();
        assert!(!config.enable_mem_control);
        assert_eq!(config.max_memtable_snapshot_num, 3);
        assert_eq!(config.file_roll_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(WalConfig::parse("file_roll_size = \"big\"").is_err());
    }
}
