//
// cache.rs -- bucket index over the arena
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! §4.3: an unordered mapping from bucket index to an arena-allocated bucket
//! blob — the hot write-set a [`crate::store::Store`] drains every commit.
//!
//! The spec frames `find(i)` as returning a mutable bucket *view* straight
//! into the arena. Safe Rust can't hand out a live `&mut Bucket` borrowed
//! from both a `HashMap` entry and an `Arena` at once without self-referential
//! trouble, so this cache instead parses an owned [`Bucket`] out of the
//! arena-backed bytes on `find`, and re-serializes it back into the arena on
//! `insert`/`create`. The handle indirection (§9 "arena-and-index pattern")
//! is preserved — only the entry point for mutation is read-modify-write
//! instead of a live view.

use std::collections::HashMap;

use crate::arena::{Arena, ArenaHandle};
use crate::bucket::Bucket;

/// `bucket_index -> arena blob` mapping, plus the arena that backs it.
pub struct Cache {
    arena: Arena,
    slots: HashMap<u64, ArenaHandle>,
    block_size: u32,
    max_entries: u16,
}

impl Cache {
    pub fn new(alloc_size: usize, block_size: u32, max_entries: u16) -> Self {
        Cache {
            arena: Arena::new(alloc_size),
            slots: HashMap::new(),
            block_size,
            max_entries,
        }
    }

    /// Allocates an empty bucket under `i` and returns it (§4.3 `create`).
    pub fn create(&mut self, i: u64) -> Bucket {
        let bucket = Bucket::empty(self.max_entries);
        self.insert(i, &bucket);
        bucket
    }

    /// Serializes `bucket` into a fresh arena slab and records it under `i`,
    /// replacing whatever was there before (§4.3 `insert`).
    pub fn insert(&mut self, i: u64, bucket: &Bucket) {
        let bytes = bucket.to_bytes(self.block_size);
        let handle = self.arena.alloc(bytes.len());
        self.arena.get_mut(handle).copy_from_slice(&bytes);
        self.slots.insert(i, handle);
    }

    /// Parses and returns the bucket stored under `i`, if any (§4.3 `find`).
    pub fn find(&self, i: u64) -> Option<Bucket> {
        let handle = *self.slots.get(&i)?;
        let bytes = self.arena.get(handle);
        Bucket::read(
            &mut &bytes[..],
            self.block_size,
            self.max_entries,
            Bucket::NO_SPILL_CHECK,
        )
        .ok()
    }

    pub fn contains(&self, i: u64) -> bool {
        self.slots.contains_key(&i)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bucket indices currently dirtied since the last commit, in no
    /// particular order — the commit phases iterate this to drain the cache.
    pub fn dirty_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.keys().copied()
    }

    /// Drops all entries and returns the arena to the free list, ready for
    /// reuse (§4.3 `clear`).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.arena.clear();
    }

    /// Releases the arena's free-list memory back to the allocator (§4.3
    /// `shrink_to_fit`).
    pub fn shrink_to_fit(&mut self) {
        self.arena.shrink_to_fit();
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn capacity_bytes(&self) -> usize {
        self.arena.capacity_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{max_entries, BucketEntry};

    fn cache() -> Cache {
        Cache::new(4096, 4096, max_entries(4096, 8))
    }

    #[test]
    fn create_then_find_round_trips() {
        let mut c = cache();
        let b = c.create(7);
        assert!(b.is_empty());
        let found = c.find(7).unwrap();
        assert_eq!(found.len(), 0);
    }

    #[test]
    fn find_missing_index_is_none() {
        let c = cache();
        assert!(c.find(1).is_none());
    }

    #[test]
    fn insert_replaces_prior_contents() {
        let mut c = cache();
        let mut b = Bucket::empty(max_entries(4096, 8));
        b.insert(BucketEntry {
            hash: 1,
            offset: 0,
            size: 10,
        });
        c.insert(3, &b);
        assert_eq!(c.find(3).unwrap().len(), 1);

        let b2 = Bucket::empty(max_entries(4096, 8));
        c.insert(3, &b2);
        assert_eq!(c.find(3).unwrap().len(), 0);
    }

    #[test]
    fn clear_drops_all_entries() {
        let mut c = cache();
        c.create(1);
        c.create(2);
        assert_eq!(c.len(), 2);
        c.clear();
        assert!(c.is_empty());
        assert!(c.find(1).is_none());
    }

    #[test]
    fn dirty_indices_covers_every_inserted_slot() {
        let mut c = cache();
        c.create(1);
        c.create(2);
        c.create(3);
        let mut indices: Vec<u64> = c.dirty_indices().collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2, 3]);
    }
}
