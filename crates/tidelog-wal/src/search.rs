// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 The Tidelog Authors

//! Reconstruction of logical write requests by consensus search index.
//!
//! A logical write may be logged as several consecutive entries sharing
//! one search index (an oversized tablet split into slices, or a batch of
//! rows). Replay folds each group back into a single request, reading
//! across file boundaries when a roll split the group.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use tidelog_core::{Result, WalError};

use crate::buffer::WalBuffer;
use crate::entry::{InsertPlan, InsertRowPlan, InsertTabletPlan, WalEntry, WalPayload};
use crate::layout::{self, WalFileInfo};
use crate::reader::WalFileReader;

/// A logical write reconstructed from the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayRequest {
    /// A single row insert.
    Row(InsertRowPlan),
    /// A single tablet slice.
    Tablet(InsertTabletPlan),
    /// Slices of one oversized tablet write, in slice order.
    MultiTablet(Vec<InsertTabletPlan>),
    /// Row inserts all targeting one device.
    RowsOfOneDevice(Vec<InsertRowPlan>),
    /// Row inserts spanning devices.
    Rows(Vec<InsertRowPlan>),
}

impl ReplayRequest {
    /// The search index shared by every part of this request.
    #[must_use]
    pub fn search_index(&self) -> u64 {
        match self {
            Self::Row(p) => p.search_index,
            Self::Tablet(p) => p.search_index,
            Self::MultiTablet(parts) => parts.first().map_or(0, |p| p.search_index),
            Self::RowsOfOneDevice(parts) | Self::Rows(parts) => {
                parts.first().map_or(0, |p| p.search_index)
            }
        }
    }
}

/// Folds insert plans sharing one search index into a single request.
/// Callers keep the slices of one logical write contiguous and homogeneous;
/// this only preserves their order.
fn merge_insert_plans(mut plans: Vec<InsertPlan>) -> Option<ReplayRequest> {
    match plans.len() {
        0 => None,
        1 => Some(match plans.remove(0) {
            InsertPlan::Row(p) => ReplayRequest::Row(p),
            InsertPlan::Tablet(p) => ReplayRequest::Tablet(p),
        }),
        _ => {
            if matches!(plans[0], InsertPlan::Tablet(_)) {
                let tablets: Vec<InsertTabletPlan> = plans
                    .into_iter()
                    .filter_map(|plan| match plan {
                        InsertPlan::Tablet(p) => Some(p),
                        InsertPlan::Row(p) => {
                            warn!(
                                index = p.search_index,
                                "dropping row insert mixed into a tablet group"
                            );
                            None
                        }
                    })
                    .collect();
                Some(ReplayRequest::MultiTablet(tablets))
            } else {
                let mut same_device = true;
                let device = plans[0].device().to_string();
                let rows: Vec<InsertRowPlan> = plans
                    .into_iter()
                    .filter_map(|plan| match plan {
                        InsertPlan::Row(p) => {
                            if p.device != device {
                                same_device = false;
                            }
                            Some(p)
                        }
                        InsertPlan::Tablet(p) => {
                            warn!(
                                index = p.search_index,
                                "dropping tablet insert mixed into a row group"
                            );
                            None
                        }
                    })
                    .collect();
                Some(if same_device {
                    ReplayRequest::RowsOfOneDevice(rows)
                } else {
                    ReplayRequest::Rows(rows)
                })
            }
        }
    }
}

/// Incremental fold of insert entries into merged requests, carried across
/// files.
///
/// Strict scans (point and range lookup) collect only consecutive indexes
/// from the starting target. Tolerant scans (the catch-up iterator) adopt
/// an index jump as the new target, so a gap in the log is surfaced to the
/// consumer instead of stalling the cursor.
struct GroupScan {
    target: u64,
    strict: bool,
    pending: Vec<InsertPlan>,
    completed: Vec<ReplayRequest>,
}

impl GroupScan {
    fn strict(target: u64) -> Self {
        Self { target, strict: true, pending: Vec::new(), completed: Vec::new() }
    }

    fn tolerant(target: u64) -> Self {
        Self { target, strict: false, pending: Vec::new(), completed: Vec::new() }
    }

    /// Feeds one decoded entry. Non-insert entries close the open group;
    /// so does an insert carrying a different index.
    fn accept(&mut self, entry: WalEntry) {
        match entry.payload {
            WalPayload::InsertRow(p) => self.accept_insert(InsertPlan::Row(p)),
            WalPayload::InsertTablet(p) => self.accept_insert(InsertPlan::Tablet(p)),
            _ => self.close_group(),
        }
    }

    fn accept_insert(&mut self, plan: InsertPlan) {
        let index = plan.search_index();
        if index < self.target {
            // already replayed, or never requested
            return;
        }
        if index > self.target {
            self.close_group();
            if index != self.target {
                if self.strict {
                    return;
                }
                self.target = index;
            }
        }
        self.pending.push(plan);
    }

    /// Emits the open group, if any, advancing the target past it.
    fn close_group(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Some(request) = merge_insert_plans(std::mem::take(&mut self.pending)) {
            self.target += 1;
            self.completed.push(request);
        }
    }
}

/// Feeds every entry of `file` into the scan. A read error stops this file
/// with a logged error; entries decoded before it are kept.
fn scan_file(file: &WalFileInfo, scan: &mut GroupScan, limit: Option<usize>) {
    let mut reader = match WalFileReader::open(&file.path) {
        Ok(reader) => reader,
        Err(e) => {
            error!(path = %file.path.display(), error = %e, "failed to open wal file");
            return;
        }
    };
    loop {
        if let Some(limit) = limit {
            if scan.completed.len() >= limit {
                return;
            }
        }
        match reader.next_entry() {
            Ok(Some(entry)) => scan.accept(entry),
            Ok(None) => return,
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "failed to read wal file");
                return;
            }
        }
    }
}

/// Reads `file` only as far as needed to close the scan's open group.
/// Entries past the closure stay on disk for the next scan.
fn chase_open_group(file: &WalFileInfo, scan: &mut GroupScan) {
    let closed_at = scan.completed.len() + 1;
    let mut reader = match WalFileReader::open(&file.path) {
        Ok(reader) => reader,
        Err(e) => {
            error!(path = %file.path.display(), error = %e, "failed to open wal file");
            return;
        }
    };
    loop {
        match reader.next_entry() {
            Ok(Some(entry)) => {
                scan.accept(entry);
                if scan.completed.len() >= closed_at {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "failed to read wal file");
                return;
            }
        }
    }
}

/// Reconstructs up to `count` consecutive requests starting at `start`.
///
/// A group still open when every durable file is exhausted is emitted from
/// what is on disk; point repair serves durable state, unlike the catch-up
/// iterator which holds such a group for the next flush.
pub(crate) fn find_requests(dir: &Path, start: u64, count: usize) -> Vec<ReplayRequest> {
    if count == 0 {
        return Vec::new();
    }
    let files = match layout::list_wal_files(dir) {
        Ok(files) => files,
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "failed to list wal files");
            return Vec::new();
        }
    };
    let Some(file_index) = layout::binary_search_by_search_index(&files, start) else {
        return Vec::new();
    };

    let end = start.saturating_add(count as u64 - 1);
    let mut scan = GroupScan::strict(start);
    for file in &files[file_index..] {
        if end < file.start_search_index {
            // a later file proves the open group is closed
            scan.close_group();
            break;
        }
        scan_file(file, &mut scan, Some(count));
        if scan.completed.len() >= count {
            return scan.completed;
        }
    }
    scan.close_group();
    scan.completed.truncate(count);
    scan.completed
}

/// Forward cursor over logical writes by search index, used by followers
/// catching up on replicated state.
///
/// Not safe for sharing across tasks; exactly one consumer drives it.
pub struct WalRequestIterator {
    identifier: String,
    dir: PathBuf,
    buffer: Arc<WalBuffer>,
    next_search_index: u64,
    files: Vec<WalFileInfo>,
    current_file: usize,
    needs_refresh: bool,
    /// Files below this version are fully consumed; re-listing skips them.
    searched_floor_version: u64,
    batch: VecDeque<ReplayRequest>,
}

impl WalRequestIterator {
    pub(crate) fn new(
        identifier: String,
        dir: PathBuf,
        buffer: Arc<WalBuffer>,
        start: u64,
    ) -> Self {
        Self {
            identifier,
            dir,
            buffer,
            next_search_index: start,
            files: Vec::new(),
            current_file: 0,
            needs_refresh: true,
            searched_floor_version: 0,
            batch: VecDeque::new(),
        }
    }

    /// Returns true when a request with the cursor's next search index is
    /// fully reconstructible from durable files.
    ///
    /// A group split by a roll is chased into later files; if the files
    /// run out before the group closes, it is held back until subsequent
    /// flushes supply the tail.
    pub fn has_next(&mut self) -> bool {
        if !self.batch.is_empty() {
            return true;
        }
        loop {
            if self.needs_refresh || self.files.is_empty() {
                self.refresh_files();
                if self.needs_refresh {
                    return false;
                }
            }

            let mut scan = GroupScan::tolerant(self.next_search_index);
            scan_file(&self.files[self.current_file], &mut scan, None);

            if scan.pending.is_empty() {
                self.current_file += 1;
            } else {
                self.chase(&mut scan);
            }

            if self.current_file >= self.files.len() {
                self.needs_refresh = true;
            } else {
                self.searched_floor_version = self.files[self.current_file].version;
            }

            if !scan.completed.is_empty() {
                self.batch = scan.completed.into();
                return true;
            }
            if self.needs_refresh {
                return false;
            }
        }
    }

    /// Follows a group left open at the end of the current file into later
    /// files until it closes or durable data runs out.
    fn chase(&mut self, scan: &mut GroupScan) {
        let mut index = self.current_file + 1;
        while index < self.files.len() {
            let before = scan.completed.len();
            chase_open_group(&self.files[index], scan);
            if scan.completed.len() > before {
                // entries pushed while closing belong to the next group;
                // rescanning this file picks them up with the advanced
                // target
                scan.pending.clear();
                self.current_file = index;
                return;
            }
            index += 1;
        }
        // exhausted mid-group: hold it for the next flush
        self.needs_refresh = true;
    }

    /// Returns the next reconstructed request, advancing the cursor past
    /// its search index. A request whose index exceeds the expected one is
    /// logged and accepted.
    pub fn next(&mut self) -> Option<ReplayRequest> {
        if self.batch.is_empty() && !self.has_next() {
            return None;
        }
        let request = self.batch.pop_front()?;
        let index = request.search_index();
        if index != self.next_search_index {
            warn!(
                node = %self.identifier,
                expected = self.next_search_index,
                actual = index,
                "search index is not continuous, skipping ahead"
            );
        }
        self.next_search_index = index + 1;
        Some(request)
    }

    /// Blocks until the next request is reconstructible.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Closed`] when the buffer shuts down.
    pub async fn wait_for_next_ready(&mut self) -> Result<()> {
        while !self.has_next() {
            self.buffer.wait_for_flush().await?;
        }
        Ok(())
    }

    /// Like [`Self::wait_for_next_ready`], failing with
    /// [`WalError::Timeout`] when `timeout` elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Timeout`] on deadline, [`WalError::Closed`]
    /// when the buffer shuts down.
    pub async fn wait_for_next_ready_timeout(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.has_next() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(WalError::Timeout("next replay request"));
            }
            if !self.buffer.wait_for_flush_timeout(remaining).await? {
                // a flush may have landed between the check and the wait
                return if self.has_next() {
                    Ok(())
                } else {
                    Err(WalError::Timeout("next replay request"))
                };
            }
        }
        Ok(())
    }

    /// Moves the cursor to `index`. Skipping backwards is legal but
    /// logged: requests before the old position may already have been
    /// consumed once.
    pub fn skip_to(&mut self, index: u64) {
        if index < self.next_search_index {
            warn!(
                node = %self.identifier,
                from = self.next_search_index,
                to = index,
                "skipping backwards, already-replayed requests may surface again"
            );
            self.searched_floor_version = 0;
        }
        self.batch.clear();
        self.next_search_index = index;
        self.files.clear();
        self.current_file = 0;
        self.needs_refresh = true;
    }

    fn refresh_files(&mut self) {
        let files = match layout::list_wal_files(&self.dir) {
            Ok(files) => files,
            Err(e) => {
                error!(node = %self.identifier, error = %e, "failed to list wal files");
                return;
            }
        };
        let files: Vec<WalFileInfo> = files
            .into_iter()
            .filter(|f| f.version >= self.searched_floor_version)
            .collect();
        match layout::binary_search_by_search_index(&files, self.next_search_index) {
            Some(index) => {
                self.searched_floor_version = files[index].version;
                self.files = files;
                self.current_file = index;
                self.needs_refresh = false;
            }
            None => {
                self.files.clear();
                self.current_file = 0;
                self.needs_refresh = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn row(index: u64, device: &str) -> InsertPlan {
        InsertPlan::Row(
            InsertRowPlan::new(device, Bytes::from_static(b"r")).with_search_index(index),
        )
    }

    fn tablet(index: u64, start: u32, end: u32) -> InsertPlan {
        InsertPlan::Tablet(
            InsertTabletPlan::new("root.sg.d1", start, end, Bytes::from_static(b"t"))
                .with_search_index(index),
        )
    }

    #[test]
    fn test_merge_single_plan_passes_through() {
        let merged = merge_insert_plans(vec![row(3, "root.sg.d1")]).unwrap();
        assert!(matches!(merged, ReplayRequest::Row(_)));
        assert_eq!(merged.search_index(), 3);
    }

    #[test]
    fn test_merge_tablets_preserves_slice_order() {
        let merged =
            merge_insert_plans(vec![tablet(7, 0, 100), tablet(7, 100, 200)]).unwrap();
        match merged {
            ReplayRequest::MultiTablet(parts) => {
                let bounds: Vec<(u32, u32)> =
                    parts.iter().map(|p| (p.row_start, p.row_end)).collect();
                assert_eq!(bounds, vec![(0, 100), (100, 200)]);
            }
            other => panic!("expected multi-tablet, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_rows_same_device() {
        let merged =
            merge_insert_plans(vec![row(4, "root.sg.d1"), row(4, "root.sg.d1")]).unwrap();
        assert!(matches!(merged, ReplayRequest::RowsOfOneDevice(_)));
    }

    #[test]
    fn test_merge_rows_mixed_devices() {
        let merged =
            merge_insert_plans(vec![row(4, "root.sg.d1"), row(4, "root.sg.d2")]).unwrap();
        assert!(matches!(merged, ReplayRequest::Rows(_)));
    }

    #[test]
    fn test_strict_scan_stops_collecting_at_gap() {
        let mut scan = GroupScan::strict(1);
        for plan in [row(1, "d"), row(2, "d"), row(5, "d")] {
            scan.accept_insert(plan);
        }
        scan.close_group();
        let indexes: Vec<u64> = scan.completed.iter().map(ReplayRequest::search_index).collect();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[test]
    fn test_tolerant_scan_adopts_gap() {
        let mut scan = GroupScan::tolerant(1);
        for plan in [row(1, "d"), row(5, "d"), row(5, "d")] {
            scan.accept_insert(plan);
        }
        scan.close_group();
        let indexes: Vec<u64> = scan.completed.iter().map(ReplayRequest::search_index).collect();
        assert_eq!(indexes, vec![1, 5]);
    }

    #[test]
    fn test_scan_skips_stale_indexes() {
        let mut scan = GroupScan::strict(10);
        for plan in [row(8, "d"), row(9, "d"), row(10, "d")] {
            scan.accept_insert(plan);
        }
        scan.close_group();
        let indexes: Vec<u64> = scan.completed.iter().map(ReplayRequest::search_index).collect();
        assert_eq!(indexes, vec![10]);
    }
}
