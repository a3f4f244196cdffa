//
// hashutil.rs -- NuDB hash and linear-hashing routines
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the nudb-native software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use crate::error::Error;
use crate::Result;

/// Identifies a hasher in on-disk headers (§6 `hasher_id`).
pub const HASHER_FNV1A64: u16 = 1;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// The hasher capability (§1: "an abstract... *hasher* capability producing
/// a 64-bit digest from a key"). Salt is mixed in by every implementation,
/// not applied by the caller, so that different algorithms can mix it in
/// the way that best avoids pathological collisions for that algorithm.
pub trait Hasher: Send + Sync {
    /// Stable identifier stored in the key/log headers.
    fn id(&self) -> u16;

    /// 64-bit digest of `key`, salted with `salt`.
    fn hash(&self, key: &[u8], salt: u64) -> u64;
}

/// FNV-1a, folded over the little-endian bytes of `salt` as an extra
/// "prefix" before the key. Self-contained (no external crate) in the same
/// spirit as the teacher's hand-rolled `hash_key`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fnv1a64;

impl Hasher for Fnv1a64 {
    fn id(&self) -> u16 {
        HASHER_FNV1A64
    }

    fn hash(&self, key: &[u8], salt: u64) -> u64 {
        let mut h = FNV_OFFSET_BASIS;
        for &b in salt.to_le_bytes().iter().chain(key.iter()) {
            h ^= u64::from(b);
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }
}

/// Resolves a stored `hasher_id` back into a [`Hasher`] implementation.
pub fn hasher_for_id(id: u16) -> Result<Box<dyn Hasher>> {
    match id {
        HASHER_FNV1A64 => Ok(Box::new(Fnv1a64)),
        _ => Err(Error::HasherMismatch {
            found: id,
            expected: HASHER_FNV1A64,
        }),
    }
}

/// Integrity check stored alongside `salt` in the key/log headers (§6, §9
/// glossary: "pepper = hash(salt)").
pub fn pepper_of(hasher: &dyn Hasher, salt: u64) -> u64 {
    hasher.hash(&salt.to_be_bytes(), 0)
}

/// `bucket_index(h) = linear_hash(h, modulus, buckets)` (§3 invariants).
///
/// `modulus` is a power of two with `modulus/2 <= buckets <= modulus`.
/// Buckets `< buckets` have already been created at the new (doubled)
/// modulus; buckets `>= buckets` haven't split yet this epoch and are
/// still addressed at the old, halved modulus.
pub fn linear_hash_index(hash: u64, modulus: u64, buckets: u64) -> u64 {
    debug_assert!(modulus.is_power_of_two());
    debug_assert!(buckets > 0 && buckets <= modulus && modulus / 2 <= buckets);

    let idx = hash % modulus;
    if idx < buckets {
        idx
    } else {
        hash % (modulus / 2)
    }
}
