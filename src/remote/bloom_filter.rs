use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, SyncResult};

/// Compact membership check the server attaches to existence filters so the
/// client can detect missed deletes without re-fetching a target's full
/// result set.
///
/// Membership hashing uses the first 16 bytes of a SHA-256 digest split into
/// two 64-bit halves, combined with double hashing; the server builds the
/// bitmap with the same scheme.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: u32) -> SyncResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!(
                "invalid bloom filter padding: {padding}"
            )));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument("empty bloom filter cannot have padding"));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("bloom filter hash count must be positive"));
        }
        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bits: bitmap,
            bit_count,
            hash_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Whether `value` may be in the set. False positives are possible,
    /// false negatives are not.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        for i in 0..self.hash_count as u64 {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            if !self.is_bit_set(combined % self.bit_count) {
                return false;
            }
        }
        true
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bits[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

/// Builds the bitmap for a set of members; mirrors the server-side encoding
/// and backs the aggregator tests.
pub fn build_bitmap(members: &[&str], bit_count: u64, hash_count: u32) -> Vec<u8> {
    let mut bits = vec![0u8; bit_count.div_ceil(8) as usize];
    if bit_count == 0 {
        return bits;
    }
    for member in members {
        let (h1, h2) = hash_halves(member);
        for i in 0..hash_count as u64 {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            let index = combined % bit_count;
            bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_padding() {
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert!(!filter.might_contain("documents/a"));
    }

    #[test]
    fn members_are_always_found() {
        let members = ["documents/a", "documents/b", "documents/c"];
        let bitmap = build_bitmap(&members, 64, 4);
        let filter = BloomFilter::new(bitmap, 0, 4).unwrap();
        for member in members {
            assert!(filter.might_contain(member));
        }
    }

    #[test]
    fn absent_members_are_usually_missed() {
        let members = ["documents/a"];
        let bitmap = build_bitmap(&members, 256, 7);
        let filter = BloomFilter::new(bitmap, 0, 7).unwrap();
        let misses = (0..100)
            .filter(|i| !filter.might_contain(&format!("documents/other-{i}")))
            .count();
        // A 256-bit filter with one member has a negligible false-positive
        // rate; allow a couple anyway.
        assert!(misses >= 98);
    }
}
