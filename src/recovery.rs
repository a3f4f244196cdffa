//
// recovery.rs -- crash recovery via log replay
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! §4.5: a pure procedure over the three file paths, with no `Store` in
//! memory. Replays the log's bucket pre-images back into the key file, then
//! truncates both data and key files to the sizes recorded at commit start.

use std::path::Path;

use crate::error::Error;
use crate::file::{NuFile, StdFile};
use crate::header::{validate_triple, DataHeader, KeyHeader, LogHeader};
use crate::ser::read_u64;
use crate::Result;

/// §4.5 recover. Idempotent: running it again on an already-recovered
/// (clean) database is a no-op.
pub fn recover(data_path: &Path, key_path: &Path, log_path: &Path) -> Result<()> {
    if !log_path.exists() {
        return Ok(());
    }
    let log = StdFile::open(log_path)?;
    let log_len = log.len()?;
    if log_len == 0 {
        return Ok(());
    }

    let mut header_buf = vec![0u8; LogHeader::ON_DISK_SIZE as usize];
    log.read_at(&mut header_buf, 0)?;
    let log_header = LogHeader::read(&mut &header_buf[..])?;

    let data = StdFile::open(data_path)?;
    let key = StdFile::open(key_path)?;

    let mut data_buf = vec![0u8; DataHeader::ON_DISK_SIZE as usize];
    data.read_at(&mut data_buf, 0)?;
    let data_header = DataHeader::read(&mut &data_buf[..])?;

    let mut key_buf = vec![0u8; KeyHeader::ON_DISK_SIZE as usize];
    key.read_at(&mut key_buf, 0)?;
    let key_header = KeyHeader::read(&mut &key_buf[..])?;

    validate_triple(&data_header, &key_header, Some(&log_header))?;

    let record_size = 8 + log_header.block_size as u64;
    let mut offset = LogHeader::ON_DISK_SIZE;
    let mut replayed = 0u64;
    while offset + record_size <= log_len {
        let mut idx_buf = [0u8; 8];
        log.read_at(&mut idx_buf, offset)?;
        let index = read_u64(&mut &idx_buf[..])?;

        let mut preimage = vec![0u8; log_header.block_size as usize];
        log.read_at(&mut preimage, offset + 8)?;

        let slot = KeyHeader::ON_DISK_SIZE + index * log_header.block_size as u64;
        key.write_at(&preimage, slot)?;

        offset += record_size;
        replayed += 1;
    }

    data.truncate(log_header.data_file_size)?;
    data.sync()?;
    key.truncate(log_header.key_file_size)?;
    key.sync()?;

    log.truncate(0)?;
    log.sync()?;

    tracing::info!(replayed, "recovery complete");
    Ok(())
}
