//
// ser.rs -- NuDB binary wire-format helpers
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! NuDB's on-disk format is fixed big-endian with no alignment switch (§6),
//! unlike the variable endian/alignment GDBM wire format this crate grew
//! out of. What remains of that module is the width-48 helpers: bucket
//! entries and data-record headers pack offsets and sizes into 48 bits
//! (§4.2, §3), a width `byteorder` has no native support for.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Reads a 48-bit big-endian unsigned integer, zero-extended into a `u64`.
pub fn read_u48(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 6];
    r.read_exact(&mut buf)?;
    Ok(buf.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// Writes the low 48 bits of `val` as a big-endian integer.
///
/// # Panics
/// Panics if `val` does not fit in 48 bits.
pub fn write_u48(w: &mut impl Write, val: u64) -> io::Result<()> {
    assert!(val < (1u64 << 48), "{val} does not fit in 48 bits");
    let bytes = val.to_be_bytes();
    w.write_all(&bytes[2..8])
}

pub fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    r.read_u16::<BigEndian>()
}

pub fn write_u16(w: &mut impl Write, val: u16) -> io::Result<()> {
    w.write_u16::<BigEndian>(val)
}

pub fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    r.read_u32::<BigEndian>()
}

pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(val)
}

pub fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    r.read_u64::<BigEndian>()
}

pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_u64::<BigEndian>(val)
}
