//! `DoubleHasher`: SHA-256 applied twice, the identity function for payloads
//! and blocks throughout the relay.

use sha2::{Digest, Sha256};

/// 32-byte double-SHA256 digest.
pub type Hash256 = [u8; 32];

/// Computes `SHA256(SHA256(bytes))`.
///
/// This is the only cryptographic validation the relay performs on block or
/// transaction contents; it establishes identity, not authenticity.
pub fn double_sha256(bytes: &[u8]) -> Hash256 {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}

/// Verifies a standard Bitcoin-style merkle root: pairwise double-SHA256 of
/// leaf hashes, duplicating the last element on an odd level, until a single
/// root hash remains.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return [0u8; 32]
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("non-empty"));
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                double_sha256(&buf)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha256_is_deterministic() {
        let a = double_sha256(b"hello world");
        let b = double_sha256(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, double_sha256(b"hello worlds"));
    }

    #[test]
    fn merkle_root_single_leaf_is_identity() {
        let leaf = double_sha256(b"only tx");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn merkle_root_duplicates_odd_tail() {
        let a = double_sha256(b"a");
        let b = double_sha256(b"b");
        let c = double_sha256(b"c");

        let with_dup = merkle_root(&[a, b, c]);
        let manual_pad = merkle_root(&[a, b, c, c]);
        assert_eq!(with_dup, manual_pad);
    }
}
