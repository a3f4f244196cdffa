//
// store.rs -- the NuDB public engine
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! §4.4: owns the three files, the current bucket-count/modulus state, the
//! dual write caches `p1`/`p0`, and the background commit worker. This is
//! the module the budget in §2 calls "~55%" for a reason — fetch, insert,
//! split, and the four-phase commit protocol all live here.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher as _};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::bucket::{max_entries, Bucket, BucketEntry};
use crate::cache::Cache;
use crate::error::Error;
use crate::file::{NuFile, StdFile};
use crate::hashutil::{hasher_for_id, linear_hash_index, pepper_of, Hasher};
use crate::header::{validate_triple, DataHeader, KeyHeader, LogHeader, CURRENT_VERSION};
use crate::options::StoreOptions;
use crate::ser::{read_u48, write_u48, write_u64};
use crate::Result;

/// Outcome of [`Store::insert`] (§4.4.2, §6 `insert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

struct Inner {
    p1: Cache,
    p0: Cache,
    pending: Vec<u8>,
    next_data_offset: u64,
    buckets: u64,
    modulus: u64,
    data_file_size: u64,
    key_file_size: u64,
    inserted_items: u64,
    error: Option<Error>,
}

struct Shared {
    data: Box<dyn NuFile>,
    key: Box<dyn NuFile>,
    log: Box<dyn NuFile>,
    hasher: Box<dyn Hasher>,
    salt: u64,
    pepper: u64,
    uid: u64,
    appnum: u64,
    key_size: u16,
    block_size: u32,
    max_entries: u16,
    load_factor: f32,
    store_options: StoreOptions,
    inner: Mutex<Inner>,
    cv: Condvar,
    shutdown: AtomicBool,
    closed: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

/// A handle to an open database (§3 "Lifecycle"). Cheaply cloneable; every
/// clone shares the same underlying files, caches, and commit worker (§5:
/// "the engine exposes thread-safe `insert` and `fetch`").
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

fn random_u64() -> u64 {
    RandomState::new().build_hasher().finish()
}

impl Store {
    /// §6 `create`: materializes a new database. Errors if any of the three
    /// files already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        data_path: &Path,
        key_path: &Path,
        log_path: &Path,
        appnum: u64,
        salt: u64,
        key_size: u16,
        block_size: u32,
        load_factor: f32,
        hasher_id: u16,
        store_options: StoreOptions,
    ) -> Result<Store> {
        if data_path.exists() {
            return Err(Error::FileExists { which: "data" });
        }
        if key_path.exists() {
            return Err(Error::FileExists { which: "key" });
        }
        if log_path.exists() {
            return Err(Error::FileExists { which: "log" });
        }

        let hasher = hasher_for_id(hasher_id)?;
        let pepper = pepper_of(hasher.as_ref(), salt);
        let uid = random_u64();
        let max_ent = max_entries(block_size, key_size);

        let data = StdFile::create_new(data_path)?;
        let data_header = DataHeader {
            version: CURRENT_VERSION,
            uid,
            appnum,
            key_size,
        };
        let mut buf = Vec::new();
        data_header.write(&mut buf)?;
        data.write_at(&buf, 0)?;
        data.sync()?;

        let key = StdFile::create_new(key_path)?;
        let key_header = KeyHeader {
            version: CURRENT_VERSION,
            uid,
            appnum,
            key_size,
            salt,
            pepper,
            block_size,
            hasher_id,
            load_factor_raw: (load_factor * 65535.0).round() as u16,
            buckets: 1,
            modulus: 1,
        };
        let mut buf = Vec::new();
        key_header.write(&mut buf)?;
        key.write_at(&buf, 0)?;
        let empty_bucket = Bucket::empty(max_ent).to_bytes(block_size);
        key.write_at(&empty_bucket, KeyHeader::ON_DISK_SIZE)?;
        key.sync()?;

        let log = StdFile::create_new(log_path)?;
        log.truncate(0)?;

        tracing::info!(?data_path, ?key_path, ?log_path, block_size, key_size, "created database");

        Store::assemble(
            Box::new(data),
            Box::new(key),
            Box::new(log),
            hasher,
            salt,
            pepper,
            uid,
            appnum,
            key_size,
            block_size,
            max_ent,
            load_factor,
            store_options,
            1,
            1,
            DataHeader::ON_DISK_SIZE,
            KeyHeader::ON_DISK_SIZE + block_size as u64,
            0,
        )
    }

    /// §6 `open`: opens a cleanly-closed database. Errors with
    /// [`Error::LogFileExists`] if the log is non-empty; the caller must run
    /// [`crate::recover`] first.
    pub fn open(
        data_path: &Path,
        key_path: &Path,
        log_path: &Path,
        store_options: StoreOptions,
    ) -> Result<Store> {
        let data = StdFile::open(data_path)?;
        let key = StdFile::open(key_path)?;

        let mut buf = vec![0u8; DataHeader::ON_DISK_SIZE as usize];
        data.read_at(&mut buf, 0)?;
        let data_header = DataHeader::read(&mut &buf[..])?;

        let mut buf = vec![0u8; KeyHeader::ON_DISK_SIZE as usize];
        key.read_at(&mut buf, 0)?;
        let key_header = KeyHeader::read(&mut &buf[..])?;

        validate_triple(&data_header, &key_header, None)?;

        let hasher = hasher_for_id(key_header.hasher_id)?;
        if pepper_of(hasher.as_ref(), key_header.salt) != key_header.pepper {
            return Err(Error::PepperMismatch);
        }

        let log_len = if log_path.exists() {
            std::fs::metadata(log_path)?.len()
        } else {
            0
        };
        if log_len > 0 {
            return Err(Error::LogFileExists);
        }
        let log = if log_path.exists() {
            StdFile::open(log_path)?
        } else {
            StdFile::create_new(log_path)?
        };

        let max_ent = max_entries(key_header.block_size, key_header.key_size);
        let data_file_size = data.len()?;
        let key_file_size = key.len()?;
        let inserted_items = count_entries(&key, &data, &key_header, max_ent)?;

        tracing::info!(?data_path, buckets = key_header.buckets, inserted_items, "opened database");

        Store::assemble(
            Box::new(data),
            Box::new(key),
            Box::new(log),
            hasher,
            key_header.salt,
            key_header.pepper,
            key_header.uid,
            key_header.appnum,
            key_header.key_size,
            key_header.block_size,
            max_ent,
            key_header.load_factor(),
            store_options,
            key_header.buckets,
            key_header.modulus,
            data_file_size,
            key_file_size,
            inserted_items,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        data: Box<dyn NuFile>,
        key: Box<dyn NuFile>,
        log: Box<dyn NuFile>,
        hasher: Box<dyn Hasher>,
        salt: u64,
        pepper: u64,
        uid: u64,
        appnum: u64,
        key_size: u16,
        block_size: u32,
        max_ent: u16,
        load_factor: f32,
        store_options: StoreOptions,
        buckets: u64,
        modulus: u64,
        data_file_size: u64,
        key_file_size: u64,
        inserted_items: u64,
    ) -> Result<Store> {
        let inner = Inner {
            p1: Cache::new(store_options.alloc_size, block_size, max_ent),
            p0: Cache::new(store_options.alloc_size, block_size, max_ent),
            pending: Vec::new(),
            next_data_offset: data_file_size,
            buckets,
            modulus,
            data_file_size,
            key_file_size,
            inserted_items,
            error: None,
        };

        let shared = Arc::new(Shared {
            data,
            key,
            log,
            hasher,
            salt,
            pepper,
            uid,
            appnum,
            key_size,
            block_size,
            max_entries: max_ent,
            load_factor,
            store_options,
            inner: Mutex::new(inner),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("nudb-commit".into())
                .spawn(move || commit_worker_loop(shared))
                .map_err(Error::Io)?
        };
        *shared.worker.lock().unwrap() = Some(handle);

        Ok(Store { shared })
    }

    fn check_key_size(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.shared.key_size as usize {
            return Err(Error::KeySizeMismatch {
                found: key.len() as u16,
                expected: self.shared.key_size,
            });
        }
        Ok(())
    }

    fn checked(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        let guard = self.shared.inner.lock().unwrap();
        if let Some(err) = &guard.error {
            return Err(err.clone());
        }
        Ok(())
    }

    /// §4.4.1 fetch.
    pub fn fetch<F: FnOnce(&[u8])>(&self, key: &[u8], visitor: F) -> Result<bool> {
        self.check_key_size(key)?;
        self.checked()?;

        let hash = self.shared.hasher.hash(key, self.shared.salt);
        let guard = self.shared.inner.lock().unwrap();
        let i = linear_hash_index(hash, guard.modulus, guard.buckets);

        if let Some(bucket) = guard.p1.find(i).or_else(|| guard.p0.find(i)) {
            drop(guard);
            if let Some((offset, size)) = self.find_in_chain(bucket, hash, key)? {
                let value = self.record_value(offset, size)?;
                visitor(&value);
                return Ok(true);
            }
            return Ok(false);
        }
        drop(guard);

        let bucket = self.read_key_bucket(i)?;
        if let Some((offset, size)) = self.find_in_chain(bucket, hash, key)? {
            let value = self.record_value(offset, size)?;
            visitor(&value);
            return Ok(true);
        }
        Ok(false)
    }

    /// Convenience wrapper over [`Store::fetch`] that copies the value out.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut out = None;
        let hit = self.fetch(key, |v| out = Some(v.to_vec()))?;
        Ok(if hit { out } else { None })
    }

    /// §4.4.2 insert.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome> {
        self.check_key_size(key)?;
        if value.len() as u64 >= (1u64 << 32) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "value too large",
            )));
        }

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }

        let hash = self.shared.hasher.hash(key, self.shared.salt);
        let mut guard = self.shared.inner.lock().unwrap();
        if let Some(err) = &guard.error {
            return Err(err.clone());
        }

        let i = linear_hash_index(hash, guard.modulus, guard.buckets);
        let probe = self.current_bucket(&guard, i)?;
        if self.find_in_chain(probe, hash, key)?.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }

        // append the data record to the pending (not yet flushed) buffer
        let record_offset = guard.next_data_offset;
        let mut record = Vec::with_capacity(6 + key.len() + value.len());
        write_u48(&mut record, value.len() as u64)?;
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        guard.next_data_offset += record.len() as u64;
        guard.pending.extend_from_slice(&record);

        // §G: split (if warranted) happens before the triggering entry is
        // placed, so worst-case post-insert occupancy is exactly
        // max_entries rather than max_entries + 1.
        let prospective = guard.inserted_items + 1;
        let threshold = guard.buckets as f64
            * self.shared.max_entries as f64
            * self.shared.load_factor as f64;
        if prospective as f64 > threshold {
            self.split(&mut guard)?;
        }

        let i = linear_hash_index(hash, guard.modulus, guard.buckets);
        let mut bucket = self.current_bucket(&guard, i)?;
        if bucket.is_full() {
            let spill_offset = self.append_spill_record(&mut guard, &bucket);
            bucket = Bucket::empty(self.shared.max_entries);
            bucket.set_spill(spill_offset);
        }
        bucket.insert(BucketEntry {
            hash,
            offset: record_offset,
            size: value.len() as u64,
        });
        guard.p1.insert(i, &bucket);
        guard.inserted_items = prospective;

        let over_threshold = guard.p1.len() >= self.shared.store_options.commit_cache_threshold
            || guard.pending.len() >= self.shared.store_options.commit_pending_bytes_threshold;
        drop(guard);
        if over_threshold {
            self.shared.cv.notify_one();
        }

        Ok(InsertOutcome::Inserted)
    }

    /// §4.4.2 step 7: grows the bucket table by exactly one bucket.
    fn split(&self, guard: &mut Inner) -> Result<()> {
        let new_buckets = guard.buckets + 1;
        let mut new_modulus = guard.modulus;
        if new_buckets > new_modulus {
            new_modulus *= 2;
        }
        let source_index = new_buckets / 2 - 1;
        let dest_index = new_buckets - 1;

        let source_bucket = self.current_bucket(guard, source_index)?;
        let mut entries = source_bucket.entries().to_vec();
        let mut spill = source_bucket.spill();
        while spill != 0 {
            let spill_bucket = self.read_spill_bucket(spill)?;
            entries.extend_from_slice(spill_bucket.entries());
            spill = spill_bucket.spill();
        }

        let mut at_source = Bucket::empty(self.shared.max_entries);
        let mut at_dest = Bucket::empty(self.shared.max_entries);
        let mut source_overflow: Vec<Bucket> = Vec::new();
        let mut dest_overflow: Vec<Bucket> = Vec::new();

        for e in entries {
            let target = linear_hash_index(e.hash, new_modulus, new_buckets);
            debug_assert!(target == source_index || target == dest_index);
            let (head, overflow) = if target == source_index {
                (&mut at_source, &mut source_overflow)
            } else {
                (&mut at_dest, &mut dest_overflow)
            };
            if head.is_full() {
                overflow.push(std::mem::replace(head, Bucket::empty(self.shared.max_entries)));
            }
            head.insert(e);
        }

        let source_spill = self.materialize_chain(guard, source_overflow);
        at_source.set_spill(source_spill);
        let dest_spill = self.materialize_chain(guard, dest_overflow);
        at_dest.set_spill(dest_spill);

        guard.p1.insert(source_index, &at_source);
        guard.p1.insert(dest_index, &at_dest);
        guard.buckets = new_buckets;
        guard.modulus = new_modulus;

        tracing::info!(buckets = new_buckets, modulus = new_modulus, "bucket split");
        Ok(())
    }

    /// Bucket `i` as it stands right now: `p1`, then `p0`, then disk, then
    /// (for a bucket the linear-hashing rule hasn't extended the key file
    /// to yet) empty.
    fn current_bucket(&self, guard: &Inner, i: u64) -> Result<Bucket> {
        if let Some(b) = guard.p1.find(i) {
            return Ok(b);
        }
        if let Some(b) = guard.p0.find(i) {
            return Ok(b);
        }
        let slot_end = KeyHeader::ON_DISK_SIZE + (i + 1) * self.shared.block_size as u64;
        if slot_end <= guard.key_file_size {
            self.read_key_bucket(i)
        } else {
            Ok(Bucket::empty(self.shared.max_entries))
        }
    }

    fn read_key_bucket(&self, index: u64) -> Result<Bucket> {
        let offset = KeyHeader::ON_DISK_SIZE + index * self.shared.block_size as u64;
        let mut buf = vec![0u8; self.shared.block_size as usize];
        self.shared.key.read_at(&mut buf, offset)?;
        let data_len = self.shared.data.len()?;
        Bucket::read(
            &mut &buf[..],
            self.shared.block_size,
            self.shared.max_entries,
            data_len,
        )
    }

    fn read_spill_bucket(&self, spill_offset: u64) -> Result<Bucket> {
        let mut sentinel = [0u8; 6];
        self.shared.data.read_at(&mut sentinel, spill_offset)?;
        let mut buf = vec![0u8; self.shared.block_size as usize];
        self.shared.data.read_at(&mut buf, spill_offset + 6)?;
        let data_len = self.shared.data.len()?;
        Bucket::read(
            &mut &buf[..],
            self.shared.block_size,
            self.shared.max_entries,
            data_len,
        )
    }

    fn record_key(&self, data_offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.shared.key_size as usize];
        self.shared.data.read_at(&mut buf, data_offset + 6)?;
        Ok(buf)
    }

    fn record_value(&self, data_offset: u64, value_size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; value_size as usize];
        self.shared
            .data
            .read_at(&mut buf, data_offset + 6 + self.shared.key_size as u64)?;
        Ok(buf)
    }

    /// Walks a bucket and its overflow chain for an exact (hash, key) match
    /// (§4.4.1: "fingerprint equality on hash is a filter, never the
    /// answer").
    fn find_in_chain(&self, mut bucket: Bucket, hash: u64, key: &[u8]) -> Result<Option<(u64, u64)>> {
        const MAX_CHAIN: usize = 1 << 20;
        let mut hops = 0;
        loop {
            let lo = bucket.lower_bound(hash);
            for e in bucket.entries()[lo..].iter().take_while(|e| e.hash == hash) {
                if self.record_key(e.offset)? == key {
                    return Ok(Some((e.offset, e.size)));
                }
            }
            if bucket.spill() == 0 {
                return Ok(None);
            }
            hops += 1;
            if hops > MAX_CHAIN {
                return Err(Error::BadChain { index: bucket.spill() });
            }
            bucket = self.read_spill_bucket(bucket.spill())?;
        }
    }

    fn append_spill_record(&self, guard: &mut Inner, bucket: &Bucket) -> u64 {
        let bytes = bucket.to_bytes(self.shared.block_size);
        let offset = guard.next_data_offset;
        let mut record = Vec::with_capacity(6 + bytes.len());
        write_u48(&mut record, 0).expect("sentinel fits in 48 bits");
        record.extend_from_slice(&bytes);
        guard.next_data_offset += record.len() as u64;
        guard.pending.extend_from_slice(&record);
        offset
    }

    fn materialize_chain(&self, guard: &mut Inner, chain: Vec<Bucket>) -> u64 {
        let mut next_spill = 0u64;
        for mut b in chain {
            b.set_spill(next_spill);
            next_spill = self.append_spill_record(guard, &b);
        }
        next_spill
    }

    /// Forces an immediate synchronous commit (§4.4.3), used by [`Store::close`]
    /// and available directly for callers that want a commit barrier.
    pub fn commit(&self) -> Result<()> {
        do_commit(&self.shared)
    }

    /// §6 `close`: flushes any pending commit and truncates the log.
    /// Idempotent; subsequent `insert`/`fetch` calls return
    /// [`Error::StoreClosed`].
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_one();
        if let Some(handle) = self.shared.worker.lock().unwrap().take() {
            handle.join().expect("commit worker thread panicked");
        }
        do_commit(&self.shared)?;
        let guard = self.shared.inner.lock().unwrap();
        if let Some(err) = &guard.error {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Number of keys ever inserted (informational; matches `inserted_items`
    /// in the load-factor formula of §8).
    pub fn len(&self) -> u64 {
        self.shared.inner.lock().unwrap().inserted_items
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buckets(&self) -> u64 {
        self.shared.inner.lock().unwrap().buckets
    }
}

fn count_entries(
    key: &dyn NuFile,
    data: &dyn NuFile,
    kh: &KeyHeader,
    max_ent: u16,
) -> Result<u64> {
    let mut total = 0u64;
    let data_len = data.len()?;
    for i in 0..kh.buckets {
        let offset = KeyHeader::ON_DISK_SIZE + i * kh.block_size as u64;
        let mut buf = vec![0u8; kh.block_size as usize];
        key.read_at(&mut buf, offset)?;
        let mut bucket = Bucket::read(&mut &buf[..], kh.block_size, max_ent, data_len)?;
        loop {
            total += bucket.len() as u64;
            if bucket.spill() == 0 {
                break;
            }
            let mut sentinel = [0u8; 6];
            data.read_at(&mut sentinel, bucket.spill())?;
            let mut sbuf = vec![0u8; kh.block_size as usize];
            data.read_at(&mut sbuf, bucket.spill() + 6)?;
            bucket = Bucket::read(&mut &sbuf[..], kh.block_size, max_ent, data_len)?;
        }
    }
    Ok(total)
}

fn commit_worker_loop(shared: Arc<Shared>) {
    loop {
        {
            let mut guard = shared.inner.lock().unwrap();
            loop {
                let shutting_down = shared.shutdown.load(Ordering::Acquire);
                if shutting_down && guard.pending.is_empty() && guard.p1.is_empty() {
                    return;
                }
                let over_threshold = guard.p1.len() >= shared.store_options.commit_cache_threshold
                    || guard.pending.len() >= shared.store_options.commit_pending_bytes_threshold;
                if over_threshold
                    || (shutting_down && (!guard.pending.is_empty() || !guard.p1.is_empty()))
                {
                    break;
                }
                let (next_guard, _timeout) =
                    shared.cv.wait_timeout(guard, Duration::from_secs(1)).unwrap();
                guard = next_guard;
                guard.p1.arena_mut().periodic_activity(Instant::now());
            }
        }
        if let Err(e) = do_commit(&shared) {
            tracing::warn!(error = %e, "commit worker failed");
            shared.inner.lock().unwrap().error.get_or_insert(e);
        }
    }
}

/// §4.4.3: the four-phase commit protocol, run by the background worker and
/// synchronously by [`Store::close`].
fn do_commit(shared: &Arc<Shared>) -> Result<()> {
    let (dirty, pending, data_file_size_before, key_file_size_before, buckets_on_disk_before) = {
        let mut guard = shared.inner.lock().unwrap();
        std::mem::swap(&mut guard.p1, &mut guard.p0);
        let pending = std::mem::take(&mut guard.pending);
        let data_file_size_before = guard.data_file_size;
        let key_file_size_before = guard.key_file_size;
        let buckets_on_disk_before =
            (key_file_size_before - KeyHeader::ON_DISK_SIZE) / shared.block_size as u64;
        let dirty: Vec<u64> = guard.p0.dirty_indices().collect();
        (dirty, pending, data_file_size_before, key_file_size_before, buckets_on_disk_before)
    };

    if dirty.is_empty() && pending.is_empty() {
        return Ok(());
    }

    tracing::debug!(buckets = dirty.len(), pending_bytes = pending.len(), "commit: log phase");

    let mut log_buf = Vec::new();
    let log_header = LogHeader {
        version: CURRENT_VERSION,
        uid: shared.uid,
        appnum: shared.appnum,
        key_size: shared.key_size,
        salt: shared.salt,
        pepper: shared.pepper,
        block_size: shared.block_size,
        hasher_id: shared.hasher.id(),
        key_file_size: key_file_size_before,
        data_file_size: data_file_size_before,
    };
    log_header.write(&mut log_buf)?;
    for &idx in &dirty {
        if idx >= buckets_on_disk_before {
            continue;
        }
        let offset = KeyHeader::ON_DISK_SIZE + idx * shared.block_size as u64;
        let mut preimage = vec![0u8; shared.block_size as usize];
        shared.key.read_at(&mut preimage, offset)?;
        write_u64(&mut log_buf, idx)?;
        log_buf.extend_from_slice(&preimage);
    }
    shared.log.write_at(&log_buf, 0)?;
    shared.log.truncate(log_buf.len() as u64)?;
    shared.log.sync()?;

    tracing::debug!("commit: data phase");

    if !pending.is_empty() {
        shared.data.write_at(&pending, data_file_size_before)?;
    }
    let data_file_size_after = data_file_size_before + pending.len() as u64;
    shared.data.sync()?;

    tracing::debug!(buckets = dirty.len(), "commit: key phase");

    let mut key_file_size_after = key_file_size_before;
    {
        let guard = shared.inner.lock().unwrap();
        for &idx in &dirty {
            let bucket = guard
                .p0
                .find(idx)
                .expect("dirty index recorded in p0 must still be present");
            let offset = KeyHeader::ON_DISK_SIZE + idx * shared.block_size as u64;
            let bytes = bucket.to_bytes(shared.block_size);
            shared.key.write_at(&bytes, offset)?;
            key_file_size_after = key_file_size_after.max(offset + bytes.len() as u64);
        }
    }
    shared.key.sync()?;

    tracing::debug!("commit: truncate phase");

    shared.log.truncate(0)?;
    shared.log.sync()?;

    {
        let mut guard = shared.inner.lock().unwrap();
        guard.p0.clear();
        guard.data_file_size = data_file_size_after;
        guard.key_file_size = key_file_size_after;
    }

    Ok(())
}

/// §4.4.4 rekey (declarative contract): regenerates a key file by streaming
/// the data file. `key_path` must not already exist.
#[allow(clippy::too_many_arguments)]
pub fn rekey(
    data_path: &Path,
    key_path: &Path,
    log_path: &Path,
    salt: u64,
    block_size: u32,
    hasher_id: u16,
    load_factor: f32,
    item_count: u64,
    buffer_bytes: usize,
) -> Result<()> {
    if key_path.exists() {
        return Err(Error::FileExists { which: "key" });
    }

    let data = StdFile::open(data_path)?;
    let data_len = data.len()?;
    let mut buf = vec![0u8; DataHeader::ON_DISK_SIZE as usize];
    data.read_at(&mut buf, 0)?;
    let data_header = DataHeader::read(&mut &buf[..])?;

    let hasher = hasher_for_id(hasher_id)?;
    let pepper = pepper_of(hasher.as_ref(), salt);
    let max_ent = max_entries(block_size, data_header.key_size);

    let target_buckets =
        ((item_count as f64 / (max_ent as f64 * load_factor as f64)).ceil() as u64).max(1);
    let modulus = target_buckets.next_power_of_two().max(1);
    let buckets = target_buckets;

    let mut staged: Vec<Bucket> = (0..buckets).map(|_| Bucket::empty(max_ent)).collect();
    let mut overflow_chains: Vec<Vec<Bucket>> = (0..buckets).map(|_| Vec::new()).collect();

    let mut entries_seen = 0u64;
    let mut offset = DataHeader::ON_DISK_SIZE;
    while offset < data_len {
        let mut size_buf = [0u8; 6];
        data.read_at(&mut size_buf, offset)?;
        let value_size = read_u48(&mut &size_buf[..])?;
        if value_size == 0 {
            offset += 6 + block_size as u64;
            continue;
        }

        let mut key_buf = vec![0u8; data_header.key_size as usize];
        data.read_at(&mut key_buf, offset + 6)?;
        let hash = hasher.hash(&key_buf, salt);
        let i = linear_hash_index(hash, modulus, buckets) as usize;
        let entry = BucketEntry {
            hash,
            offset,
            size: value_size,
        };

        if staged[i].is_full() {
            overflow_chains[i].push(std::mem::replace(&mut staged[i], Bucket::empty(max_ent)));
        }
        staged[i].insert(entry);
        entries_seen += 1;

        offset += 6 + data_header.key_size as u64 + value_size;
    }

    if entries_seen > item_count {
        tracing::warn!(entries_seen, item_count, "rekey: actual item count exceeded the hint");
    }

    let key = StdFile::create_new(key_path)?;
    let key_header = KeyHeader {
        version: CURRENT_VERSION,
        uid: data_header.uid,
        appnum: data_header.appnum,
        key_size: data_header.key_size,
        salt,
        pepper,
        block_size,
        hasher_id,
        load_factor_raw: (load_factor * 65535.0).round() as u16,
        buckets,
        modulus,
    };
    let mut buf = Vec::new();
    key_header.write(&mut buf)?;
    key.write_at(&buf, 0)?;

    let mut append_offset = data_len;
    for (i, mut head) in staged.into_iter().enumerate() {
        let mut next_spill = 0u64;
        for mut overflow_bucket in overflow_chains[i].drain(..) {
            overflow_bucket.set_spill(next_spill);
            let bytes = overflow_bucket.to_bytes(block_size);
            let mut record = Vec::with_capacity(6 + bytes.len());
            write_u48(&mut record, 0)?;
            record.extend_from_slice(&bytes);
            data.write_at(&record, append_offset)?;
            next_spill = append_offset;
            append_offset += record.len() as u64;
        }
        head.set_spill(next_spill);
        let slot_offset = KeyHeader::ON_DISK_SIZE + i as u64 * block_size as u64;
        key.write_at(&head.to_bytes(block_size), slot_offset)?;
    }
    data.truncate(append_offset)?;
    data.sync()?;
    key.sync()?;

    if log_path.exists() {
        let log = StdFile::open(log_path)?;
        log.truncate(0)?;
        log.sync()?;
    }

    tracing::info!(buckets, entries_seen, "rekey complete");
    Ok(())
}

/// §4.4.4 verify (declarative contract). Chooses the fast (bitmap) path
/// when `buffer_bytes` can hold the whole key file, else the slow path that
/// re-runs the normal fetch walk for every data record.
pub fn verify(data_path: &Path, key_path: &Path, buffer_bytes: usize) -> Result<()> {
    let data = StdFile::open(data_path)?;
    let key = StdFile::open(key_path)?;

    let mut buf = vec![0u8; KeyHeader::ON_DISK_SIZE as usize];
    key.read_at(&mut buf, 0)?;
    let kh = KeyHeader::read(&mut &buf[..])?;
    let key_file_len = key.len()?;

    if buffer_bytes as u64 >= key_file_len {
        verify_fast(&data, &key, &kh)
    } else {
        verify_slow(&data, &key, &kh)
    }
}

fn verify_fast(data: &dyn NuFile, key: &dyn NuFile, kh: &KeyHeader) -> Result<()> {
    let max_ent = max_entries(kh.block_size, kh.key_size);
    let mut offsets = std::collections::HashSet::new();
    let data_len = data.len()?;

    for i in 0..kh.buckets {
        let mut offset = KeyHeader::ON_DISK_SIZE + i * kh.block_size as u64;
        let mut buf = vec![0u8; kh.block_size as usize];
        key.read_at(&mut buf, offset)?;
        let mut bucket = Bucket::read(&mut &buf[..], kh.block_size, max_ent, data_len)?;
        loop {
            for e in bucket.entries() {
                offsets.insert(e.offset);
            }
            if bucket.spill() == 0 {
                break;
            }
            offset = bucket.spill();
            let mut sentinel = [0u8; 6];
            data.read_at(&mut sentinel, offset)?;
            let mut sbuf = vec![0u8; kh.block_size as usize];
            data.read_at(&mut sbuf, offset + 6)?;
            bucket = Bucket::read(&mut &sbuf[..], kh.block_size, max_ent, data_len)?;
        }
    }

    let mut offset = DataHeader::ON_DISK_SIZE;
    while offset < data_len {
        let mut size_buf = [0u8; 6];
        data.read_at(&mut size_buf, offset)?;
        let value_size = read_u48(&mut &size_buf[..])?;
        if value_size == 0 {
            offset += 6 + kh.block_size as u64;
            continue;
        }
        if !offsets.remove(&offset) {
            return Err(Error::DataMissing { offset });
        }
        offset += 6 + kh.key_size as u64 + value_size;
    }

    if let Some(&stale) = offsets.iter().next() {
        return Err(Error::DataMissing { offset: stale });
    }
    Ok(())
}

fn verify_slow(data: &dyn NuFile, key: &dyn NuFile, kh: &KeyHeader) -> Result<()> {
    let max_ent = max_entries(kh.block_size, kh.key_size);
    let hasher = hasher_for_id(kh.hasher_id)?;

    let data_len = data.len()?;
    let mut offset = DataHeader::ON_DISK_SIZE;
    while offset < data_len {
        let mut size_buf = [0u8; 6];
        data.read_at(&mut size_buf, offset)?;
        let value_size = read_u48(&mut &size_buf[..])?;
        if value_size == 0 {
            offset += 6 + kh.block_size as u64;
            continue;
        }

        let mut key_buf = vec![0u8; kh.key_size as usize];
        data.read_at(&mut key_buf, offset + 6)?;
        let hash = hasher.hash(&key_buf, kh.salt);
        let i = linear_hash_index(hash, kh.modulus, kh.buckets);

        let mut buf = vec![0u8; kh.block_size as usize];
        key.read_at(&mut buf, KeyHeader::ON_DISK_SIZE + i * kh.block_size as u64)?;
        let mut bucket = Bucket::read(&mut &buf[..], kh.block_size, max_ent, data_len)?;

        let mut found = false;
        loop {
            let lo = bucket.lower_bound(hash);
            if bucket.entries()[lo..]
                .iter()
                .take_while(|e| e.hash == hash)
                .any(|e| e.offset == offset)
            {
                found = true;
                break;
            }
            if bucket.spill() == 0 {
                break;
            }
            let mut sentinel = [0u8; 6];
            data.read_at(&mut sentinel, bucket.spill())?;
            let mut sbuf = vec![0u8; kh.block_size as usize];
            data.read_at(&mut sbuf, bucket.spill() + 6)?;
            bucket = Bucket::read(&mut &sbuf[..], kh.block_size, max_ent, data_len)?;
        }
        if !found {
            return Err(Error::DataMissing { offset });
        }

        offset += 6 + kh.key_size as u64 + value_size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CreateOptions, OpenOptions};

    fn paths(dir: &tempfile::TempDir) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
        (dir.path().join("d"), dir.path().join("k"), dir.path().join("l"))
    }

    #[test]
    fn create_insert_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        let store = CreateOptions::new()
            .key_size(8)
            .block_size(4096)
            .load_factor(0.5)
            .create(&d, &k, &l)
            .unwrap();

        let key = b"00000001";
        assert_eq!(store.insert(key, b"hello").unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.get(key).unwrap(), Some(b"hello".to_vec()));
        store.close().unwrap();
    }

    #[test]
    fn reopen_after_close_persists_data() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        {
            let store = CreateOptions::new().key_size(8).create(&d, &k, &l).unwrap();
            store.insert(b"00000001", b"hello").unwrap();
            store.close().unwrap();
        }
        let store = OpenOptions::new().open(&d, &k, &l).unwrap();
        assert_eq!(store.get(b"00000001").unwrap(), Some(b"hello".to_vec()));
        store.close().unwrap();
    }

    #[test]
    fn duplicate_insert_is_rejected_and_keeps_first_value() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        let store = CreateOptions::new().key_size(2).create(&d, &k, &l).unwrap();
        assert_eq!(store.insert(b"AA", b"x").unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(b"AA", b"y").unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.get(b"AA").unwrap(), Some(b"x".to_vec()));
        store.close().unwrap();
    }

    #[test]
    fn fetch_of_absent_key_is_a_clean_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        let store = CreateOptions::new().key_size(4).create(&d, &k, &l).unwrap();
        assert_eq!(store.get(b"ABCD").unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn enough_inserts_force_a_split() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        let store = CreateOptions::new()
            .key_size(4)
            .block_size(96) // max_entries = (96-8)/20 = 4
            .load_factor(0.5)
            .create(&d, &k, &l)
            .unwrap();

        assert_eq!(store.buckets(), 1);
        for i in 0u32..20 {
            let key = i.to_be_bytes();
            store.insert(&key, b"v").unwrap();
        }
        assert!(store.buckets() > 1, "bucket count should have grown under load");

        for i in 0u32..20 {
            let key = i.to_be_bytes();
            assert_eq!(store.get(&key).unwrap(), Some(b"v".to_vec()));
        }
        store.close().unwrap();
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        let store = CreateOptions::new().key_size(4).create(&d, &k, &l).unwrap();
        assert!(store.insert(b"toolong", b"v").is_err());
        store.close().unwrap();
    }

    #[test]
    fn manual_commit_is_observable_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let (d, k, l) = paths(&dir);
        let store = CreateOptions::new().key_size(4).create(&d, &k, &l).unwrap();
        store.insert(b"AAAA", b"v").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get(b"AAAA").unwrap(), Some(b"v".to_vec()));
        store.close().unwrap();
    }
}
