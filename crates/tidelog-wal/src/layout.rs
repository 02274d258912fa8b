//! WAL file naming and lookup.
//!
//! Log files are named `_<version>-<startSearchIndex>-<format>.wal`.
//! `version` is monotonic within a node and orders the files; the start
//! search index is a lower bound on the search index of every insert entry
//! in the file, which lets consumers binary-search the file list instead of
//! scanning from the beginning.

use std::path::{Path, PathBuf};

/// Extension of WAL files.
pub const WAL_FILE_SUFFIX: &str = ".wal";

/// Revision of the on-disk record format, embedded in file names.
pub const WAL_FORMAT_VERSION: u32 = 1;

const WAL_FILE_PREFIX: &str = "_";

/// A WAL file located in a node directory, identified by the fields parsed
/// from its name. Internal code passes these around; paths only matter at
/// I/O boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileInfo {
    /// Version id parsed from the file name.
    pub version: u64,
    /// Lower bound on the search index of every insert entry in the file.
    pub start_search_index: u64,
    /// Location on disk.
    pub path: PathBuf,
}

/// Builds the file name for a log file.
pub fn file_name(version: u64, start_search_index: u64) -> String {
    format!("{WAL_FILE_PREFIX}{version}-{start_search_index}-{WAL_FORMAT_VERSION}{WAL_FILE_SUFFIX}")
}

/// Parses `(version, start_search_index)` out of a file name, or `None`
/// for names that are not well-formed WAL file names.
pub fn parse_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name
        .strip_prefix(WAL_FILE_PREFIX)?
        .strip_suffix(WAL_FILE_SUFFIX)?;
    let mut parts = stem.split('-');
    let version = parts.next()?.parse().ok()?;
    let start_search_index = parts.next()?.parse().ok()?;
    let _format: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((version, start_search_index))
}

/// Lists the WAL files in a directory in ascending order. Files whose
/// names do not parse are skipped.
pub fn list_wal_files(dir: &Path) -> std::io::Result<Vec<WalFileInfo>> {
    let mut files = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((version, start_search_index)) = parse_file_name(name) {
            files.push(WalFileInfo { version, start_search_index, path });
        }
    }
    sort_ascending(&mut files);
    Ok(files)
}

/// Sorts files ascending by start search index; files sharing a start
/// index are ordered by version.
pub fn sort_ascending(files: &mut [WalFileInfo]) {
    files.sort_by_key(|f| (f.start_search_index, f.version));
}

/// Locates the file where reconstruction of `index` must begin, or `None`
/// when `index` precedes every file.
///
/// This is the last file whose start index is at most `index`, stepped
/// back over files whose start index equals `index`: a group of entries
/// sharing the previous file's last index may begin in the previous file,
/// so reconstruction has to start there.
pub fn binary_search_by_search_index(files: &[WalFileInfo], index: u64) -> Option<usize> {
    let n = files.partition_point(|f| f.start_search_index <= index);
    if n == 0 {
        return None;
    }
    let mut i = n - 1;
    while i > 0 && files[i].start_search_index == index {
        i -= 1;
    }
    Some(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: u64, start: u64) -> WalFileInfo {
        WalFileInfo {
            version,
            start_search_index: start,
            path: PathBuf::from(file_name(version, start)),
        }
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = file_name(42, 1007);
        assert_eq!(name, "_42-1007-1.wal");
        assert_eq!(parse_file_name(&name), Some((42, 1007)));
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert_eq!(parse_file_name("42-7-1.wal"), None);
        assert_eq!(parse_file_name("_42-7-1.log"), None);
        assert_eq!(parse_file_name("_42-7.wal"), None);
        assert_eq!(parse_file_name("_42-x-1.wal"), None);
        assert_eq!(parse_file_name("_42-7-1-9.wal"), None);
        assert_eq!(parse_file_name("checkpoint"), None);
    }

    #[test]
    fn test_sort_orders_equal_starts_by_version() {
        let mut files = vec![info(3, 7), info(1, 0), info(2, 7)];
        sort_ascending(&mut files);
        let order: Vec<u64> = files.iter().map(|f| f.version).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_binary_search_basic() {
        let files = vec![info(0, 0), info(1, 5), info(2, 9)];
        assert_eq!(binary_search_by_search_index(&files, 1), Some(0));
        assert_eq!(binary_search_by_search_index(&files, 6), Some(1));
        assert_eq!(binary_search_by_search_index(&files, 9), Some(1));
        assert_eq!(binary_search_by_search_index(&files, 100), Some(2));
    }

    #[test]
    fn test_binary_search_before_first_file() {
        let files = vec![info(4, 10), info(5, 20)];
        assert_eq!(binary_search_by_search_index(&files, 3), None);
    }

    #[test]
    fn test_binary_search_steps_back_over_equal_starts() {
        // a group carrying index 7 may start in the file before the first
        // file labeled 7
        let files = vec![info(0, 2), info(1, 7), info(2, 7), info(3, 12)];
        assert_eq!(binary_search_by_search_index(&files, 7), Some(0));
        assert_eq!(binary_search_by_search_index(&files, 8), Some(2));
    }

    #[test]
    fn test_list_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(file_name(0, 0)), b"").unwrap();
        std::fs::write(dir.path().join(file_name(1, 3)), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::write(dir.path().join("_bad-file.wal"), b"").unwrap();

        let files = list_wal_files(dir.path()).unwrap();
        let versions: Vec<u64> = files.iter().map(|f| f.version).collect();
        assert_eq!(versions, vec![0, 1]);
    }
}
