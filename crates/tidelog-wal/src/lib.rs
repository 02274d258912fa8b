// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 The Tidelog Authors

//! Per-region write-ahead log with consensus replay support.
//!
//! This crate provides:
//! - A buffered sequential writer that batches fsyncs and rolls files by
//!   version ([`buffer::WalBuffer`])
//! - Checkpoint bookkeeping of which memtables still pin which log files
//!   ([`checkpoint::CheckpointManager`])
//! - A reclaimer that deletes outdated files and, when most logged bytes
//!   describe already-durable data, asks the storage engine to snapshot or
//!   flush ([`node::WalNode::delete_outdated_files`])
//! - Reconstruction of logical write requests by consensus search index,
//!   including a resumable catch-up cursor ([`search::WalRequestIterator`])
//!
//! # How it works
//!
//! Callers log mutations through [`node::WalNode`] before applying them to
//! in-memory tables. Entries funnel through a bounded queue into a single
//! serializer task that owns the active file: it batches contiguous
//! entries, fsyncs once per batch, then completes every entry's
//! [`buffer::WalFlushListener`]. Storage-engine callbacks keep the
//! checkpoint registry in step with memtable lifecycles, and consensus
//! consumers pull replay traffic back out by search index.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod checkpoint;
pub mod engine;
pub mod entry;
pub mod layout;
pub mod node;
pub mod reader;
pub mod search;
pub mod testing;
pub mod writer;

pub use buffer::{WalBuffer, WalFlushListener};
pub use checkpoint::{CheckpointManager, MemTableInfo};
pub use engine::StorageEngine;
pub use entry::{
    DeletePlan, InsertPlan, InsertRowPlan, InsertTabletPlan, SignalKind, WalEntry, WalEntryType,
    WalPayload,
};
pub use node::WalNode;
pub use reader::WalFileReader;
pub use search::{ReplayRequest, WalRequestIterator};
