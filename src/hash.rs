// Copyright 2020 Joyent, Inc.

//! Key-to-bucket hash variants.
//!
//! A key is mapped to a server by hashing it and indexing the weighted
//! bucket vector at `hash mod len`. Three hash variants are supported for
//! compatibility with the different client generations that may share a
//! cluster; `NewCompat` is the interoperable default.

/// The supported key hashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashScheme {
    /// The client's own string hash: `h = h*31 + byte` over the UTF-8
    /// bytes, 32-bit wrapping. Stable across runs and platforms, but not
    /// shared with other client implementations.
    Native,
    /// `h = h*33 + byte`, matching the oldest generation of clients.
    OldCompat,
    /// `(crc32(key) >> 16) & 0x7fff`, the scheme most memcached clients
    /// agree on. The default.
    NewCompat,
}

impl Default for HashScheme {
    fn default() -> Self {
        HashScheme::NewCompat
    }
}

/// Hash `key` under the given scheme.
pub fn hash_key(scheme: HashScheme, key: &str) -> u32 {
    match scheme {
        HashScheme::Native => native_hash(key),
        HashScheme::OldCompat => old_compat_hash(key),
        HashScheme::NewCompat => new_compat_hash(key),
    }
}

pub(crate) fn native_hash(key: &str) -> u32 {
    key.bytes().fold(0u32, |h, b| {
        h.wrapping_mul(31).wrapping_add(u32::from(b))
    })
}

fn old_compat_hash(key: &str) -> u32 {
    key.bytes().fold(0u32, |h, b| {
        h.wrapping_mul(33).wrapping_add(u32::from(b))
    })
}

fn new_compat_hash(key: &str) -> u32 {
    (crc32fast::hash(key.as_bytes()) >> 16) & 0x7fff
}

// Failover rehash: fold the previous hash and the retry ordinal back into
// the hash space so consecutive retries land on different buckets.
pub(crate) fn rehash(hv: u32, iteration: usize) -> u32 {
    hv.wrapping_add(native_hash(&format!("{}{}", hv, iteration)))
}
