//
// error.rs -- NuDB error types
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::{fmt, io};

/// Errors produced by the NuDB engine.
#[derive(Debug)]
pub enum Error {
    /// Underlying I/O failure.
    Io(io::Error),
    /// `create` was asked to make a file that already exists.
    FileExists {
        /// Which of the three files ("data", "key", "log") already existed.
        which: &'static str,
    },
    /// `open` was asked to open a database with a non-empty log file; the
    /// caller must run [`crate::recover`] first.
    LogFileExists,
    /// A file header failed to parse structurally.
    InvalidHeader {
        /// Which file ("data", "key", "log").
        which: &'static str,
    },
    /// Header version field is not one this engine understands.
    VersionMismatch {
        which: &'static str,
        found: u16,
        expected: u16,
    },
    /// The three files' UIDs do not agree; they are not one database.
    UidMismatch { found: u64, expected: u64 },
    /// The three files' appnums do not agree.
    AppnumMismatch { found: u64, expected: u64 },
    /// key_size differs between file headers.
    KeySizeMismatch { found: u16, expected: u16 },
    /// block_size is not a power of two in `[96, 65536]`, or otherwise
    /// disagrees between header and configuration.
    BlockSizeInvalid { block_size: u32 },
    /// hasher_id in a header names an algorithm this build doesn't have.
    HasherMismatch { found: u16, expected: u16 },
    /// pepper stored in the key header does not equal hash(salt).
    PepperMismatch,
    /// The log header's salt, pepper, or hasher_id disagrees with the key
    /// header's: the log was written against a different hash layout and
    /// replaying it would corrupt the key file.
    LogHeaderMismatch { field: &'static str },
    /// `insert` of a key already present.
    KeyExists,
    /// A bucket's spill pointer references a data offset at or beyond the
    /// data file's size.
    BadSpill { offset: u64, data_file_size: u64 },
    /// A bucket's `size` field exceeds `max_entries`, or its entries were
    /// found not sorted by hash.
    BadBucket {
        offset: u64,
        size: u16,
        max_entries: u16,
    },
    /// Walking an overflow chain exceeded a sane bound, indicating a cycle
    /// or otherwise corrupt spill pointer.
    BadChain { index: u64 },
    /// A data-file record's key bytes did not match the key that pointed at
    /// it (index corruption, or the offset points at the wrong record).
    DataMissing { offset: u64 },
    /// A mutating call was made after [`crate::Store::close`].
    StoreClosed,
    /// A prior commit-worker failure is sticky until close; this is that
    /// error, replayed to every caller that follows it.
    Poisoned(String),
    /// `key_size` out of the `[1, 255]` configuration range.
    BadKeySize { key_size: usize },
    /// `load_factor` out of the `(0, 1]` configuration range.
    BadLoadFactor { load_factor: f32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::FileExists { which } => write!(f, "{which} file already exists"),
            Error::LogFileExists => {
                write!(f, "log file is non-empty; run recover() before open()")
            }
            Error::InvalidHeader { which } => write!(f, "invalid {which} file header"),
            Error::VersionMismatch {
                which,
                found,
                expected,
            } => write!(
                f,
                "{which} version mismatch: found {found}, expected {expected}"
            ),
            Error::UidMismatch { found, expected } => {
                write!(f, "uid mismatch: found {found:#x}, expected {expected:#x}")
            }
            Error::AppnumMismatch { found, expected } => write!(
                f,
                "appnum mismatch: found {found:#x}, expected {expected:#x}"
            ),
            Error::KeySizeMismatch { found, expected } => {
                write!(f, "key_size mismatch: found {found}, expected {expected}")
            }
            Error::BlockSizeInvalid { block_size } => {
                write!(f, "invalid block_size {block_size}")
            }
            Error::HasherMismatch { found, expected } => {
                write!(f, "hasher_id mismatch: found {found}, expected {expected}")
            }
            Error::PepperMismatch => write!(f, "pepper does not match hash(salt)"),
            Error::LogHeaderMismatch { field } => {
                write!(f, "log header {field} does not match key header")
            }
            Error::KeyExists => write!(f, "key already exists"),
            Error::BadSpill {
                offset,
                data_file_size,
            } => write!(
                f,
                "spill offset {offset} is at or beyond data file size {data_file_size}"
            ),
            Error::BadBucket {
                offset,
                size,
                max_entries,
            } => write!(
                f,
                "bucket at offset {offset} has size {size} > max_entries {max_entries}"
            ),
            Error::BadChain { index } => write!(f, "overflow chain at bucket {index} is corrupt"),
            Error::DataMissing { offset } => {
                write!(f, "record at offset {offset} does not match its index entry")
            }
            Error::StoreClosed => write!(f, "operation on a closed store"),
            Error::Poisoned(msg) => write!(f, "store is poisoned by a prior error: {msg}"),
            Error::BadKeySize { key_size } => {
                write!(f, "key_size {key_size} out of range [1, 255]")
            }
            Error::BadLoadFactor { load_factor } => {
                write!(f, "load_factor {load_factor} out of range (0, 1]")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Clone for Error {
    // The sticky async-error slot (§5) hands a copy of the original failure
    // to every subsequent caller; io::Error isn't Clone, so that variant
    // degrades to its Display text rather than losing the error entirely.
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Poisoned(e.to_string()),
            Error::FileExists { which } => Error::FileExists { which },
            Error::LogFileExists => Error::LogFileExists,
            Error::InvalidHeader { which } => Error::InvalidHeader { which },
            Error::VersionMismatch {
                which,
                found,
                expected,
            } => Error::VersionMismatch {
                which,
                found: *found,
                expected: *expected,
            },
            Error::UidMismatch { found, expected } => Error::UidMismatch {
                found: *found,
                expected: *expected,
            },
            Error::AppnumMismatch { found, expected } => Error::AppnumMismatch {
                found: *found,
                expected: *expected,
            },
            Error::KeySizeMismatch { found, expected } => Error::KeySizeMismatch {
                found: *found,
                expected: *expected,
            },
            Error::BlockSizeInvalid { block_size } => Error::BlockSizeInvalid {
                block_size: *block_size,
            },
            Error::HasherMismatch { found, expected } => Error::HasherMismatch {
                found: *found,
                expected: *expected,
            },
            Error::PepperMismatch => Error::PepperMismatch,
            Error::LogHeaderMismatch { field } => Error::LogHeaderMismatch { field },
            Error::KeyExists => Error::KeyExists,
            Error::BadSpill {
                offset,
                data_file_size,
            } => Error::BadSpill {
                offset: *offset,
                data_file_size: *data_file_size,
            },
            Error::BadBucket {
                offset,
                size,
                max_entries,
            } => Error::BadBucket {
                offset: *offset,
                size: *size,
                max_entries: *max_entries,
            },
            Error::BadChain { index } => Error::BadChain { index: *index },
            Error::DataMissing { offset } => Error::DataMissing { offset: *offset },
            Error::StoreClosed => Error::StoreClosed,
            Error::Poisoned(msg) => Error::Poisoned(msg.clone()),
            Error::BadKeySize { key_size } => Error::BadKeySize {
                key_size: *key_size,
            },
            Error::BadLoadFactor { load_factor } => Error::BadLoadFactor {
                load_factor: *load_factor,
            },
        }
    }
}
