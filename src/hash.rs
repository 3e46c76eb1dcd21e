pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

pub fn hash128(bytes: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128(bytes)
}

/// `HashMap` using a faster, non-DoS-resistant hasher.
///
/// Internal bookkeeping structures (descriptor table, caches) never hash
/// attacker-controlled keys, so the speedup is free.
pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;
