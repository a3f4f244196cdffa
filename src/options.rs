//
// options.rs -- NuDB create/open configuration builders
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Builder-style configuration, in the teacher's `options.rs` idiom: each
//! setter consumes and returns `Self`, and validation happens once, at the
//! terminal `create`/`open` call, rather than on every setter (§6
//! "Configuration").

use std::path::Path;

use crate::error::Error;
use crate::hashutil::HASHER_FNV1A64;
use crate::store::Store;
use crate::Result;

const MIN_BLOCK_SIZE: u32 = 96;
const MAX_BLOCK_SIZE: u32 = 65536;
const DEFAULT_ALLOC_SIZE: usize = 64 * 1024;

/// Commit-worker thresholds (§4.4.2 step 8) and the cache arenas' initial
/// block size. Shared by create and open.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Cache entry count that triggers a background commit.
    pub commit_cache_threshold: usize,
    /// Pending (un-flushed) data-writer bytes that trigger a commit.
    pub commit_pending_bytes_threshold: usize,
    /// Initial arena element size for both `p0` and `p1`.
    pub alloc_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            commit_cache_threshold: 1024,
            commit_pending_bytes_threshold: 8 * 1024 * 1024,
            alloc_size: DEFAULT_ALLOC_SIZE,
        }
    }
}

/// Builder for [`create`](CreateOptions::create) (§6 Engine API `create`).
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    appnum: u64,
    salt: Option<u64>,
    key_size: u16,
    block_size: u32,
    load_factor: f32,
    hasher_id: u16,
    store: StoreOptions,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            appnum: 0,
            salt: None,
            key_size: 8,
            block_size: 4096,
            load_factor: 0.5,
            hasher_id: HASHER_FNV1A64,
            store: StoreOptions::default(),
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appnum(self, appnum: u64) -> Self {
        CreateOptions { appnum, ..self }
    }

    /// Fixes the per-database salt instead of drawing one at random.
    /// Mainly for reproducible tests (§E).
    pub fn salt(self, salt: u64) -> Self {
        CreateOptions {
            salt: Some(salt),
            ..self
        }
    }

    pub fn key_size(self, key_size: u16) -> Self {
        CreateOptions { key_size, ..self }
    }

    pub fn block_size(self, block_size: u32) -> Self {
        CreateOptions { block_size, ..self }
    }

    pub fn load_factor(self, load_factor: f32) -> Self {
        CreateOptions {
            load_factor,
            ..self
        }
    }

    pub fn hasher_id(self, hasher_id: u16) -> Self {
        CreateOptions { hasher_id, ..self }
    }

    pub fn store_options(self, store: StoreOptions) -> Self {
        CreateOptions { store, ..self }
    }

    fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(Error::BlockSizeInvalid {
                block_size: self.block_size,
            });
        }
        if self.load_factor <= 0.0 || self.load_factor > 1.0 {
            return Err(Error::BadLoadFactor {
                load_factor: self.load_factor,
            });
        }
        if self.key_size == 0 || self.key_size > 255 {
            return Err(Error::BadKeySize {
                key_size: self.key_size as usize,
            });
        }
        Ok(())
    }

    /// Materializes a new database. Errors if any of the three files
    /// already exists (§6 `create`).
    pub fn create(
        &self,
        data_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
    ) -> Result<Store> {
        self.validate()?;
        let salt = self.salt.unwrap_or_else(random_salt);
        Store::create(
            data_path.as_ref(),
            key_path.as_ref(),
            log_path.as_ref(),
            self.appnum,
            salt,
            self.key_size,
            self.block_size,
            self.load_factor,
            self.hasher_id,
            self.store,
        )
    }
}

/// Builder for [`open`](OpenOptions::open) (§6 Engine API `open`).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    store: StoreOptions,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_options(self, store: StoreOptions) -> Self {
        OpenOptions { store }
    }

    /// Opens an existing, cleanly-closed database. Errors with
    /// [`Error::LogFileExists`] if the log is non-empty; the caller must run
    /// [`crate::recover`] first (§6 `open`).
    pub fn open(
        &self,
        data_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
    ) -> Result<Store> {
        Store::open(
            data_path.as_ref(),
            key_path.as_ref(),
            log_path.as_ref(),
            self.store,
        )
    }
}

fn random_salt() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish()
}
