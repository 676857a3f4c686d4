//! Hashing and comparison of keys.

use std::cmp::Ordering;

/// Hashes and compares key bytes for a table.
///
/// Keys that compare equal must hash equal:
///
/// ```text
/// compare(a, b) == Ordering::Equal -> hash(a) == hash(b)
/// ```
///
/// Only the low 31 bits of the hash are used.
pub trait Collation: Send + Sync {
    fn hash(&self, key: &[u8]) -> u32;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Byte-wise comparison, the collation of binary strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCollation;

impl Collation for BinaryCollation {
    fn hash(&self, key: &[u8]) -> u32 {
        hash_sort(key.iter().copied())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// ASCII case-insensitive comparison. Bytes outside `a..=z` compare as is.
#[derive(Clone, Copy, Debug, Default)]
pub struct AsciiCaseInsensitive;

impl Collation for AsciiCaseInsensitive {
    fn hash(&self, key: &[u8]) -> u32 {
        hash_sort(key.iter().map(u8::to_ascii_uppercase))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = a.iter().map(u8::to_ascii_uppercase);
        let b = b.iter().map(u8::to_ascii_uppercase);
        a.cmp(b)
    }
}

// The classic multiplicative byte hash used by binary collations.
fn hash_sort(bytes: impl Iterator<Item = u8>) -> u32 {
    let (mut nr1, mut nr2) = (1u64, 4u64);
    for b in bytes {
        nr1 ^= ((nr1 & 63).wrapping_add(nr2))
            .wrapping_mul(u64::from(b))
            .wrapping_add(nr1 << 8);
        nr2 = nr2.wrapping_add(3);
    }
    nr1 as u32
}
