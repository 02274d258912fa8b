//! WAL entries and their on-disk record format.
//!
//! Every mutation is logged as a tagged record before it reaches an
//! in-memory table. On disk a record is framed as
//!
//! ```text
//! len:u32 | type:u8 | search_index:u64 | body | crc32:u32
//! ```
//!
//! with `len` covering everything after itself. The body is the
//! bincode-encoded entry; the insert payloads inside it stay opaque to the
//! log. The search index is replicated into the frame header so scans can
//! group records without caring about payload details.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tidelog_core::{
    MemTableId, Result, WalError, DEFAULT_SAFELY_DELETED_SEARCH_INDEX, NO_SEARCH_INDEX,
};

/// Bytes of the fixed fields around a record body: length prefix, type
/// tag, search index and checksum.
pub const RECORD_OVERHEAD: usize = 4 + 1 + 8 + 4;

/// Fixed frame bytes covered by `len`: type tag, search index, checksum.
const FRAME_FIXED: u32 = 1 + 8 + 4;

/// Discriminator byte of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// A single-row insert.
    InsertRow = 1,
    /// A tablet insert, possibly one slice of a larger tablet.
    InsertTablet = 2,
    /// A deletion.
    Delete = 3,
    /// A rewritten copy of a live memtable's contents.
    MemTableSnapshot = 4,
    /// Queue control traffic for the serializer; never written to disk.
    Signal = 5,
}

impl TryFrom<u8> for WalEntryType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::InsertRow),
            2 => Ok(WalEntryType::InsertTablet),
            3 => Ok(WalEntryType::Delete),
            4 => Ok(WalEntryType::MemTableSnapshot),
            _ => Err(WalError::Corrupt(format!("invalid entry type {value}"))),
        }
    }
}

/// A single-row insert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRowPlan {
    /// Device the row belongs to.
    pub device: String,
    /// Consensus sequence number of the logical write, or
    /// [`NO_SEARCH_INDEX`].
    pub search_index: u64,
    /// Watermark hint piggybacked by consensus; the default means none.
    pub safely_deleted_search_index: u64,
    /// Encoded row, opaque to the log.
    pub payload: Bytes,
}

impl InsertRowPlan {
    /// Creates a plan without a search index.
    pub fn new(device: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            device: device.into(),
            search_index: NO_SEARCH_INDEX,
            safely_deleted_search_index: DEFAULT_SAFELY_DELETED_SEARCH_INDEX,
            payload: payload.into(),
        }
    }

    /// Sets the consensus search index.
    #[must_use]
    pub fn with_search_index(mut self, index: u64) -> Self {
        self.search_index = index;
        self
    }

    /// Sets the safely-deleted watermark hint.
    #[must_use]
    pub fn with_safely_deleted_search_index(mut self, index: u64) -> Self {
        self.safely_deleted_search_index = index;
        self
    }
}

/// A tablet insert payload covering rows `[row_start, row_end)` of the
/// original tablet. Oversized tablets are logged as several slices sharing
/// one search index; the bounds let replay concatenate them in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertTabletPlan {
    /// Device the tablet belongs to.
    pub device: String,
    /// Consensus sequence number of the logical write, or
    /// [`NO_SEARCH_INDEX`].
    pub search_index: u64,
    /// Watermark hint piggybacked by consensus; the default means none.
    pub safely_deleted_search_index: u64,
    /// First row of the slice, inclusive.
    pub row_start: u32,
    /// End of the slice, exclusive.
    pub row_end: u32,
    /// Encoded rows, opaque to the log.
    pub payload: Bytes,
}

impl InsertTabletPlan {
    /// Creates a plan covering rows `[row_start, row_end)`.
    pub fn new(
        device: impl Into<String>,
        row_start: u32,
        row_end: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            device: device.into(),
            search_index: NO_SEARCH_INDEX,
            safely_deleted_search_index: DEFAULT_SAFELY_DELETED_SEARCH_INDEX,
            row_start,
            row_end,
            payload: payload.into(),
        }
    }

    /// Sets the consensus search index.
    #[must_use]
    pub fn with_search_index(mut self, index: u64) -> Self {
        self.search_index = index;
        self
    }

    /// Sets the safely-deleted watermark hint.
    #[must_use]
    pub fn with_safely_deleted_search_index(mut self, index: u64) -> Self {
        self.safely_deleted_search_index = index;
        self
    }
}

/// A deletion payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePlan {
    /// Path pattern naming the series to delete.
    pub path_pattern: String,
    /// Encoded deletion details, opaque to the log.
    pub payload: Bytes,
}

impl DeletePlan {
    /// Creates a deletion plan.
    pub fn new(path_pattern: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { path_pattern: path_pattern.into(), payload: payload.into() }
    }
}

/// One insert slice decoded from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InsertPlan {
    /// A single-row insert.
    Row(InsertRowPlan),
    /// A tablet slice.
    Tablet(InsertTabletPlan),
}

impl InsertPlan {
    /// Device this insert targets.
    #[must_use]
    pub fn device(&self) -> &str {
        match self {
            Self::Row(p) => &p.device,
            Self::Tablet(p) => &p.device,
        }
    }

    /// Consensus search index of this insert.
    #[must_use]
    pub fn search_index(&self) -> u64 {
        match self {
            Self::Row(p) => p.search_index,
            Self::Tablet(p) => p.search_index,
        }
    }
}

/// In-band control messages consumed by the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Close the current file and open the next one at this queue
    /// position.
    RollFile {
        /// Complete the listener only after the rolled file's fsync.
        wait: bool,
    },
}

/// Payload of a WAL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalPayload {
    /// A single-row insert.
    InsertRow(InsertRowPlan),
    /// A tablet insert slice.
    InsertTablet(InsertTabletPlan),
    /// A deletion.
    Delete(DeletePlan),
    /// Serialized contents of a live memtable.
    MemTableSnapshot(Bytes),
    /// Serializer control traffic; never persisted.
    Signal(SignalKind),
}

/// A tagged record in the write-ahead log, owned by a memtable (signals
/// carry no owner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Memtable this entry belongs to; 0 for signals.
    pub memtable_id: MemTableId,
    /// The logged operation.
    pub payload: WalPayload,
}

impl WalEntry {
    /// Wraps a row insert.
    pub fn insert_row(memtable_id: MemTableId, plan: InsertRowPlan) -> Self {
        Self { memtable_id, payload: WalPayload::InsertRow(plan) }
    }

    /// Wraps a tablet insert slice.
    pub fn insert_tablet(memtable_id: MemTableId, plan: InsertTabletPlan) -> Self {
        Self { memtable_id, payload: WalPayload::InsertTablet(plan) }
    }

    /// Wraps a deletion.
    pub fn delete(memtable_id: MemTableId, plan: DeletePlan) -> Self {
        Self { memtable_id, payload: WalPayload::Delete(plan) }
    }

    /// Wraps a memtable snapshot.
    pub fn memtable_snapshot(memtable_id: MemTableId, contents: Bytes) -> Self {
        Self { memtable_id, payload: WalPayload::MemTableSnapshot(contents) }
    }

    /// Builds a control signal.
    pub fn signal(kind: SignalKind) -> Self {
        Self { memtable_id: 0, payload: WalPayload::Signal(kind) }
    }

    /// Discriminator of this entry.
    #[must_use]
    pub fn entry_type(&self) -> WalEntryType {
        match &self.payload {
            WalPayload::InsertRow(_) => WalEntryType::InsertRow,
            WalPayload::InsertTablet(_) => WalEntryType::InsertTablet,
            WalPayload::Delete(_) => WalEntryType::Delete,
            WalPayload::MemTableSnapshot(_) => WalEntryType::MemTableSnapshot,
            WalPayload::Signal(_) => WalEntryType::Signal,
        }
    }

    /// Consensus search index carried by this entry;
    /// [`NO_SEARCH_INDEX`] for everything but inserts.
    #[must_use]
    pub fn search_index(&self) -> u64 {
        match &self.payload {
            WalPayload::InsertRow(p) => p.search_index,
            WalPayload::InsertTablet(p) => p.search_index,
            _ => NO_SEARCH_INDEX,
        }
    }

    /// Returns true for insert entries, the only kind that participates in
    /// search-index replay.
    #[must_use]
    pub fn is_insert(&self) -> bool {
        matches!(
            self.payload,
            WalPayload::InsertRow(_) | WalPayload::InsertTablet(_)
        )
    }

    /// Returns true for in-band control signals.
    #[must_use]
    pub fn is_signal(&self) -> bool {
        matches!(self.payload, WalPayload::Signal(_))
    }

    /// Encodes the record frame, checksum included.
    ///
    /// # Errors
    ///
    /// Fails for signal entries (queue control only) and on body
    /// serialization failure.
    pub fn encode(&self) -> Result<Bytes> {
        if self.is_signal() {
            return Err(WalError::Serialization(
                "signal entries are not persisted".to_string(),
            ));
        }
        let body = bincode::serialize(self).map_err(|e| WalError::Serialization(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(RECORD_OVERHEAD + body.len());
        buf.put_u32_le(body.len() as u32 + FRAME_FIXED);
        buf.put_u8(self.entry_type() as u8);
        buf.put_u64_le(self.search_index());
        buf.put_slice(&body);
        let crc = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Decodes the frame content after the length prefix (type tag through
    /// checksum).
    ///
    /// # Errors
    ///
    /// [`WalError::Corrupt`] when the checksum or fixed fields are broken
    /// (the file cannot be trusted past this point);
    /// [`WalError::Serialization`] when only the body fails to decode (the
    /// record can be skipped).
    pub fn decode_frame(frame: &[u8]) -> Result<WalEntry> {
        if frame.len() < FRAME_FIXED as usize {
            return Err(WalError::Corrupt(format!(
                "record frame of {} bytes is shorter than its fixed fields",
                frame.len()
            )));
        }
        let (data, crc_bytes) = frame.split_at(frame.len() - 4);
        let expected =
            u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(data);
        if expected != actual {
            return Err(WalError::Corrupt(format!(
                "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }
        let entry_type = WalEntryType::try_from(data[0])?;
        let entry: WalEntry = bincode::deserialize(&data[9..])
            .map_err(|e| WalError::Serialization(e.to_string()))?;
        if entry.entry_type() != entry_type {
            return Err(WalError::Corrupt(format!(
                "type tag {:?} does not match body {:?}",
                entry_type,
                entry.entry_type()
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_entry(index: u64) -> WalEntry {
        WalEntry::insert_row(
            1,
            InsertRowPlan::new("root.sg.d1", Bytes::from_static(b"row-bytes"))
                .with_search_index(index),
        )
    }

    #[test]
    fn test_round_trip_insert_row() {
        let entry = row_entry(7);
        let frame = entry.encode().unwrap();
        assert_eq!(
            u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize,
            frame.len() - 4
        );
        assert_eq!(frame[4], WalEntryType::InsertRow as u8);
        let decoded = WalEntry::decode_frame(&frame[4..]).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.search_index(), 7);
    }

    #[test]
    fn test_round_trip_tablet_slice() {
        let entry = WalEntry::insert_tablet(
            3,
            InsertTabletPlan::new("root.sg.d2", 100, 200, Bytes::from_static(b"tablet"))
                .with_search_index(9),
        );
        let frame = entry.encode().unwrap();
        let decoded = WalEntry::decode_frame(&frame[4..]).unwrap();
        match decoded.payload {
            WalPayload::InsertTablet(p) => {
                assert_eq!((p.row_start, p.row_end), (100, 200));
                assert_eq!(p.search_index, 9);
            }
            other => panic!("expected tablet, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_snapshot_and_delete() {
        for entry in [
            WalEntry::memtable_snapshot(8, Bytes::from_static(b"memtable contents")),
            WalEntry::delete(8, DeletePlan::new("root.sg.**", Bytes::new())),
        ] {
            let frame = entry.encode().unwrap();
            let decoded = WalEntry::decode_frame(&frame[4..]).unwrap();
            assert_eq!(decoded, entry);
            assert_eq!(decoded.search_index(), NO_SEARCH_INDEX);
        }
    }

    #[test]
    fn test_signals_are_not_persisted() {
        let entry = WalEntry::signal(SignalKind::RollFile { wait: true });
        assert!(matches!(entry.encode(), Err(WalError::Serialization(_))));
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let mut frame = row_entry(5).encode().unwrap().to_vec();
        let mid = frame.len() / 2;
        frame[mid] ^= 0xff;
        assert!(matches!(
            WalEntry::decode_frame(&frame[4..]),
            Err(WalError::Corrupt(_))
        ));
    }
}
