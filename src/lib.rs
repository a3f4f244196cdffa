//
// lib.rs -- NuDB core library API routines
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Rust-native implementation of [NuDB](https://github.com/CPPAlliance/NuDB), an
//! append-only, insert-and-fetch key/value store for content-addressable data:
//! once written, a key's value never changes, so lookups and inserts need no
//! locking beyond serializing writers.
//!
//! # Examples
//! ```
//! use nudb::CreateOptions;
//!
//! # use tempfile::tempdir;
//! # fn main() -> Result<(), String> {
//! #     let dir = tempdir().map_err(|e| e.to_string())?;
//! #     let data = dir.path().join("db.dat");
//! #     let key = dir.path().join("db.key");
//! #     let log = dir.path().join("db.log");
//! #     || -> nudb::Result<()> {
//! // Create a new database across its three files.
//! let db = CreateOptions::new()
//!     .key_size(8)
//!     .block_size(4096)
//!     .create(&data, &key, &log)?;
//!
//! db.insert(b"12345678", b"hello world")?;
//! let value = db.get(b"12345678")?;
//! assert_eq!(value.as_deref(), Some(&b"hello world"[..]));
//!
//! db.close()?;
//! #         Ok(())
//! #     }().map_err(|e| e.to_string())
//! # }
//! ```

mod arena;
mod bucket;
mod cache;
mod error;
mod file;
mod hashutil;
mod header;
mod options;
mod recovery;
mod store;
mod visit;

pub use error::Error;
pub use hashutil::{hasher_for_id, Fnv1a64, Hasher, HASHER_FNV1A64};
pub use options::{CreateOptions, OpenOptions, StoreOptions};
pub use recovery::recover;
pub use store::{rekey, verify, InsertOutcome, Store};
pub use visit::{visit, Visit};

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
