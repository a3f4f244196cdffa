//
// header.rs -- NuDB file header routines
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! §6 "File headers": the three fixed big-endian headers that open the
//! data, key, and log files. Unlike the teacher's GDBM header, there is no
//! runtime endianness or alignment detection here — NuDB's wire format is
//! fixed at create time (§6), so reading one back is pure validation, not
//! format sniffing.

use std::io::{self, Read, Write};

use crate::error::Error;
use crate::ser::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::Result;

pub const CURRENT_VERSION: u16 = 1;

pub const DATA_MAGIC: &[u8; 8] = b"nudb.dat";
pub const KEY_MAGIC: &[u8; 8] = b"nudb.key";
pub const LOG_MAGIC: &[u8; 8] = b"nudb.log";

const DATA_RESERVED: usize = 64;

fn read_magic(r: &mut impl Read, expected: &[u8; 8], which: &'static str) -> Result<()> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    if &buf != expected {
        return Err(Error::InvalidHeader { which });
    }
    Ok(())
}

/// §6 "Data header".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub key_size: u16,
}

impl DataHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        read_magic(r, DATA_MAGIC, "data")?;
        let version = read_u16(r)?;
        if version != CURRENT_VERSION {
            return Err(Error::VersionMismatch {
                which: "data",
                found: version,
                expected: CURRENT_VERSION,
            });
        }
        let uid = read_u64(r)?;
        let appnum = read_u64(r)?;
        let key_size = read_u16(r)?;
        let mut reserved = [0u8; DATA_RESERVED];
        r.read_exact(&mut reserved)?;
        Ok(DataHeader {
            version,
            uid,
            appnum,
            key_size,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(DATA_MAGIC)?;
        write_u16(w, self.version)?;
        write_u64(w, self.uid)?;
        write_u64(w, self.appnum)?;
        write_u16(w, self.key_size)?;
        w.write_all(&[0u8; DATA_RESERVED])
    }

    pub const ON_DISK_SIZE: u64 = 8 + 2 + 8 + 8 + 2 + DATA_RESERVED as u64;
}

/// §6 "Key header".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHeader {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub key_size: u16,
    pub salt: u64,
    pub pepper: u64,
    pub block_size: u32,
    pub hasher_id: u16,
    /// Fixed-point: `load_factor = raw as f32 / 65535.0`.
    pub load_factor_raw: u16,
    pub buckets: u64,
    pub modulus: u64,
}

impl KeyHeader {
    pub fn load_factor(&self) -> f32 {
        self.load_factor_raw as f32 / 65535.0
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        read_magic(r, KEY_MAGIC, "key")?;
        let version = read_u16(r)?;
        if version != CURRENT_VERSION {
            return Err(Error::VersionMismatch {
                which: "key",
                found: version,
                expected: CURRENT_VERSION,
            });
        }
        let uid = read_u64(r)?;
        let appnum = read_u64(r)?;
        let key_size = read_u16(r)?;
        let salt = read_u64(r)?;
        let pepper = read_u64(r)?;
        let block_size = read_u32(r)?;
        let hasher_id = read_u16(r)?;
        let load_factor_raw = read_u16(r)?;
        let buckets = read_u64(r)?;
        let modulus = read_u64(r)?;
        Ok(KeyHeader {
            version,
            uid,
            appnum,
            key_size,
            salt,
            pepper,
            block_size,
            hasher_id,
            load_factor_raw,
            buckets,
            modulus,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(KEY_MAGIC)?;
        write_u16(w, self.version)?;
        write_u64(w, self.uid)?;
        write_u64(w, self.appnum)?;
        write_u16(w, self.key_size)?;
        write_u64(w, self.salt)?;
        write_u64(w, self.pepper)?;
        write_u32(w, self.block_size)?;
        write_u16(w, self.hasher_id)?;
        write_u16(w, self.load_factor_raw)?;
        write_u64(w, self.buckets)?;
        write_u64(w, self.modulus)
    }

    pub const ON_DISK_SIZE: u64 = 8 + 2 + 8 + 8 + 2 + 8 + 8 + 4 + 2 + 2 + 8 + 8;
}

/// §6 "Log header".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u16,
    pub uid: u64,
    pub appnum: u64,
    pub key_size: u16,
    pub salt: u64,
    pub pepper: u64,
    pub block_size: u32,
    pub hasher_id: u16,
    pub key_file_size: u64,
    pub data_file_size: u64,
}

impl LogHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        read_magic(r, LOG_MAGIC, "log")?;
        let version = read_u16(r)?;
        if version != CURRENT_VERSION {
            return Err(Error::VersionMismatch {
                which: "log",
                found: version,
                expected: CURRENT_VERSION,
            });
        }
        let uid = read_u64(r)?;
        let appnum = read_u64(r)?;
        let key_size = read_u16(r)?;
        let salt = read_u64(r)?;
        let pepper = read_u64(r)?;
        let block_size = read_u32(r)?;
        let hasher_id = read_u16(r)?;
        let key_file_size = read_u64(r)?;
        let data_file_size = read_u64(r)?;
        Ok(LogHeader {
            version,
            uid,
            appnum,
            key_size,
            salt,
            pepper,
            block_size,
            hasher_id,
            key_file_size,
            data_file_size,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(LOG_MAGIC)?;
        write_u16(w, self.version)?;
        write_u64(w, self.uid)?;
        write_u64(w, self.appnum)?;
        write_u16(w, self.key_size)?;
        write_u64(w, self.salt)?;
        write_u64(w, self.pepper)?;
        write_u32(w, self.block_size)?;
        write_u16(w, self.hasher_id)?;
        write_u64(w, self.key_file_size)?;
        write_u64(w, self.data_file_size)
    }

    pub const ON_DISK_SIZE: u64 = 8 + 2 + 8 + 8 + 2 + 8 + 8 + 4 + 2 + 8 + 8;
}

/// Cross-checks three freshly-read headers against each other (§6 "UID
/// binds the three files into one database"; §3 lifecycle "opened").
pub fn validate_triple(data: &DataHeader, key: &KeyHeader, log: Option<&LogHeader>) -> Result<()> {
    if data.uid != key.uid {
        return Err(Error::UidMismatch {
            found: key.uid,
            expected: data.uid,
        });
    }
    if data.appnum != key.appnum {
        return Err(Error::AppnumMismatch {
            found: key.appnum,
            expected: data.appnum,
        });
    }
    if data.key_size != key.key_size {
        return Err(Error::KeySizeMismatch {
            found: key.key_size,
            expected: data.key_size,
        });
    }
    if let Some(log) = log {
        if log.uid != data.uid {
            return Err(Error::UidMismatch {
                found: log.uid,
                expected: data.uid,
            });
        }
        if log.appnum != data.appnum {
            return Err(Error::AppnumMismatch {
                found: log.appnum,
                expected: data.appnum,
            });
        }
        if log.key_size != data.key_size {
            return Err(Error::KeySizeMismatch {
                found: log.key_size,
                expected: data.key_size,
            });
        }
        if log.block_size != key.block_size {
            return Err(Error::BlockSizeInvalid {
                block_size: log.block_size,
            });
        }
        if log.salt != key.salt {
            return Err(Error::LogHeaderMismatch { field: "salt" });
        }
        if log.hasher_id != key.hasher_id {
            return Err(Error::LogHeaderMismatch { field: "hasher_id" });
        }
        if log.pepper != key.pepper {
            return Err(Error::LogHeaderMismatch { field: "pepper" });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_round_trip() {
        let h = DataHeader {
            version: CURRENT_VERSION,
            uid: 0xdead_beef,
            appnum: 42,
            key_size: 8,
        };
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), DataHeader::ON_DISK_SIZE as usize);
        let parsed = DataHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn key_header_round_trip_and_load_factor() {
        let h = KeyHeader {
            version: CURRENT_VERSION,
            uid: 1,
            appnum: 2,
            key_size: 8,
            salt: 12345,
            pepper: 67890,
            block_size: 4096,
            hasher_id: 1,
            load_factor_raw: 32767,
            buckets: 1,
            modulus: 1,
        };
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), KeyHeader::ON_DISK_SIZE as usize);
        let parsed = KeyHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(parsed, h);
        assert!((parsed.load_factor() - 0.5).abs() < 0.001);
    }

    #[test]
    fn log_header_round_trip() {
        let h = LogHeader {
            version: CURRENT_VERSION,
            uid: 1,
            appnum: 2,
            key_size: 8,
            salt: 3,
            pepper: 4,
            block_size: 4096,
            hasher_id: 1,
            key_file_size: 9000,
            data_file_size: 123456,
        };
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), LogHeader::ON_DISK_SIZE as usize);
        let parsed = LogHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut buf = vec![0u8; DataHeader::ON_DISK_SIZE as usize];
        buf[..8].copy_from_slice(b"nope....");
        assert!(DataHeader::read(&mut &buf[..]).is_err());
    }

    #[test]
    fn validate_triple_catches_uid_mismatch() {
        let data = DataHeader {
            version: CURRENT_VERSION,
            uid: 1,
            appnum: 1,
            key_size: 8,
        };
        let key = KeyHeader {
            version: CURRENT_VERSION,
            uid: 2,
            appnum: 1,
            key_size: 8,
            salt: 0,
            pepper: 0,
            block_size: 4096,
            hasher_id: 1,
            load_factor_raw: 1,
            buckets: 1,
            modulus: 1,
        };
        assert!(validate_triple(&data, &key, None).is_err());
    }

    #[test]
    fn validate_triple_catches_log_salt_hasher_pepper_mismatch() {
        let data = DataHeader {
            version: CURRENT_VERSION,
            uid: 1,
            appnum: 1,
            key_size: 8,
        };
        let key = KeyHeader {
            version: CURRENT_VERSION,
            uid: 1,
            appnum: 1,
            key_size: 8,
            salt: 111,
            pepper: 222,
            block_size: 4096,
            hasher_id: 1,
            load_factor_raw: 1,
            buckets: 1,
            modulus: 1,
        };
        let base_log = LogHeader {
            version: CURRENT_VERSION,
            uid: 1,
            appnum: 1,
            key_size: 8,
            salt: key.salt,
            pepper: key.pepper,
            block_size: key.block_size,
            hasher_id: key.hasher_id,
            key_file_size: 0,
            data_file_size: 0,
        };
        assert!(validate_triple(&data, &key, Some(&base_log)).is_ok());

        let mut bad_salt = base_log;
        bad_salt.salt = 999;
        assert!(validate_triple(&data, &key, Some(&bad_salt)).is_err());

        let mut bad_hasher = base_log;
        bad_hasher.hasher_id = 2;
        assert!(validate_triple(&data, &key, Some(&bad_hasher)).is_err());

        let mut bad_pepper = base_log;
        bad_pepper.pepper = 999;
        assert!(validate_triple(&data, &key, Some(&bad_pepper)).is_err());
    }
}
