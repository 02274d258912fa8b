// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 The Tidelog Authors

//! Core types shared across the tidelog crates.
//!
//! This crate provides the fundamental building blocks used by the WAL node:
//! - Error types with a common `Result` alias
//! - Configuration with TOML loading
//! - Identifier and status types shared with the storage engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::WalConfig;
pub use error::{Result, WalError};
pub use types::{
    FlushStatus, MemTableId, DEFAULT_SAFELY_DELETED_SEARCH_INDEX, NO_SEARCH_INDEX,
};
