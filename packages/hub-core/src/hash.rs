//! FNV-1a hash utilities for ring point placement.
//!
//! Provides a 64-bit FNV-1a hash over raw bytes. Ring placement only needs a
//! fast, well-distributed, platform-independent hash; cryptographic strength
//! is not required. Every node must compute identical hashes for identical
//! input, so no per-process seeding is involved.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes the 64-bit FNV-1a hash of the given bytes.
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Convenience wrapper hashing a string's UTF-8 bytes.
#[must_use]
pub fn fnv1a_str(s: &str) -> u64 {
    fnv1a_64(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Reference values for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_str("foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn deterministic_across_calls() {
        let h1 = fnv1a_str("worker-42");
        let h2 = fnv1a_str("worker-42");
        assert_eq!(h1, h2);
    }

    #[test]
    fn distinct_inputs_distinct_hashes() {
        assert_ne!(fnv1a_str("node-a:0"), fnv1a_str("node-a:1"));
        assert_ne!(fnv1a_str("node-a:0"), fnv1a_str("node-b:0"));
    }
}
