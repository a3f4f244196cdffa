//
// file.rs -- abstract platform file I/O capability
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! The core engine consumes files only through this trait (§1: "the core
//! consumes an abstract *file* capability"). `StdFile` is the only
//! implementation shipped; it is a thin, positional-I/O wrapper over
//! `std::fs::File` so that concurrent readers never need to share a seek
//! cursor (§5: "reads use positional I/O and do not need the mutex beyond
//! bucket lookup").

use std::fs;
use std::io;
use std::path::Path;

/// Positional, thread-safe file I/O, as required by the store (§5: `fetch`
/// may run concurrently with the commit worker's I/O).
pub trait NuFile: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`. Short reads are an
    /// error (`io::ErrorKind::UnexpectedEof`).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes all of `buf` starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Flushes to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Truncates (or extends with zeros) to exactly `len` bytes.
    fn truncate(&self, len: u64) -> io::Result<()>;

    /// Current file size in bytes.
    fn len(&self) -> io::Result<u64>;

    /// True if the file is currently empty.
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// `std::fs::File`-backed implementation of [`NuFile`].
#[derive(Debug)]
pub struct StdFile(fs::File);

impl StdFile {
    /// Opens an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(StdFile)
    }

    /// Creates a new file; fails if one already exists at `path`.
    pub fn create_new(path: impl AsRef<Path>) -> io::Result<Self> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map(StdFile)
    }
}

#[cfg(unix)]
impl NuFile for StdFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.0.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.0.write_all_at(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.0.sync_data()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.0.set_len(len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

#[cfg(not(unix))]
impl NuFile for StdFile {
    // Platforms without pread/pwrite pay for positional access with a lock
    // around seek+read/write. Every call still ends up at the byte offset
    // the caller asked for; only the atomicity of "don't move a shared
    // cursor out from under a concurrent caller" needs help here.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        use std::sync::Mutex;
        static LOCK: Mutex<()> = Mutex::new(());
        let _guard = LOCK.lock().unwrap();
        let mut f = self.0.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        use std::sync::Mutex;
        static LOCK: Mutex<()> = Mutex::new(());
        let _guard = LOCK.lock().unwrap();
        let mut f = self.0.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.0.sync_data()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.0.set_len(len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}
