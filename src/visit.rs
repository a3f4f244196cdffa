//
// visit.rs -- streaming walk over every live record in the data file
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! §6 `visit(data_path, visitor)`: walks the data file start to end,
//! skipping spill (bucket) records via their 48-bit zero size sentinel, and
//! calls the visitor once per live `(key, value)` record.
//!
//! Skipping a spill record requires knowing `block_size` (the sentinel is
//! followed by exactly `block_size` bytes of serialized bucket), which the
//! data file's own header does not carry (§6 "Data header"). This walk
//! therefore also takes `key_path`, reading only its header, not its bucket
//! array — the same dependency `rekey` and `verify`'s fast path already
//! have on the key header for the same reason.

use std::path::Path;

use crate::error::Error;
use crate::file::{NuFile, StdFile};
use crate::header::{DataHeader, KeyHeader};
use crate::ser::read_u48;
use crate::Result;

/// A single live record handed to the visitor closure passed to [`visit`].
pub struct Visit<'a> {
    pub offset: u64,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Streams every live record in `data_path` to `visitor`, in data-file
/// order. Stops and propagates the first error `visitor` returns.
pub fn visit(
    data_path: &Path,
    key_path: &Path,
    mut visitor: impl FnMut(Visit<'_>) -> Result<()>,
) -> Result<()> {
    let data = StdFile::open(data_path)?;
    let key = StdFile::open(key_path)?;

    let mut dh_buf = vec![0u8; DataHeader::ON_DISK_SIZE as usize];
    data.read_at(&mut dh_buf, 0)?;
    let data_header = DataHeader::read(&mut &dh_buf[..])?;

    let mut kh_buf = vec![0u8; KeyHeader::ON_DISK_SIZE as usize];
    key.read_at(&mut kh_buf, 0)?;
    let key_header = KeyHeader::read(&mut &kh_buf[..])?;

    if data_header.uid != key_header.uid {
        return Err(Error::UidMismatch {
            found: key_header.uid,
            expected: data_header.uid,
        });
    }

    let data_len = data.len()?;
    let mut offset = DataHeader::ON_DISK_SIZE;
    while offset < data_len {
        let mut size_buf = [0u8; 6];
        data.read_at(&mut size_buf, offset)?;
        let value_size = read_u48(&mut &size_buf[..])?;

        if value_size == 0 {
            offset += 6 + key_header.block_size as u64;
            continue;
        }

        let mut key_buf = vec![0u8; data_header.key_size as usize];
        data.read_at(&mut key_buf, offset + 6)?;
        let mut value_buf = vec![0u8; value_size as usize];
        data.read_at(&mut value_buf, offset + 6 + data_header.key_size as u64)?;

        visitor(Visit {
            offset,
            key: &key_buf,
            value: &value_buf,
        })?;

        offset += 6 + data_header.key_size as u64 + value_size;
    }

    Ok(())
}
