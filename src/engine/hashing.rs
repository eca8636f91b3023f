//! Key hashing and bucketing.
//!
//! A key lands in one of 100 buckets (1..=100) derived from a seeded hash.
//! The same (key, seed, algorithm) always lands in the same bucket, which is
//! what keeps a user's treatment stable across evaluations and SDKs.

use crate::models::HashAlgorithm;

/// 32-bit MurmurHash3 (x86 variant) over the UTF-8 bytes of `key`.
pub fn murmur3_32(key: &str, seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let data = key.as_bytes();
    let mut h1 = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1: u32 = 0;
        for (i, byte) in tail.iter().enumerate() {
            k1 |= u32::from(*byte) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    fmix32(h1)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Java-style string hash XORed with the seed.
pub fn legacy_hash(key: &str, seed: i32) -> i32 {
    let mut h: i32 = 0;
    for c in key.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    h ^ seed
}

/// Bucket in `1..=100` for a key under the given seed and algorithm.
pub fn bucket(key: &str, seed: i32, algorithm: HashAlgorithm) -> u32 {
    match algorithm {
        HashAlgorithm::Murmur => murmur3_32(key, seed as u32) % 100 + 1,
        HashAlgorithm::Legacy => {
            (i64::from(legacy_hash(key, seed)) % 100).unsigned_abs() as u32 + 1
        }
    }
}
