use std::fmt::{Debug, Display};

use sha3::{Digest, Sha3_256};

/// SHA3-256 digest of a payload or message buffer. Payloads are
/// content-addressed by this type throughout the protocol.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashType([u8; 32]);

impl HashType {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl Debug for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.base58())
    }
}

impl Display for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base58())
    }
}

impl From<[u8; 32]> for HashType {
    fn from(hash: [u8; 32]) -> Self {
        Self(hash)
    }
}

/// A trait for hashing data.
pub(crate) trait DbrbHasher: Default {
    /// Hashes the given data in one call.
    fn digest(data: &[u8]) -> [u8; 32];

    /// Updates the hasher with the given data.
    fn update(&mut self, bytes: &[u8]);

    /// Finalizes the hasher and returns the hash.
    fn finish(&mut self) -> [u8; 32];
}

#[derive(Default)]
pub struct Sha3Hasher {
    hasher: Sha3_256,
}

impl Sha3Hasher {
    /// Hashes the concatenation of the given buffers.
    pub(crate) fn digest_buffers(buffers: &[&[u8]]) -> HashType {
        let mut hasher = Sha3Hasher::default();
        for buffer in buffers {
            hasher.update(buffer);
        }
        HashType::new(hasher.finish())
    }
}

impl DbrbHasher for Sha3Hasher {
    fn digest(data: &[u8]) -> [u8; 32] {
        let mut dest = [0; 32];
        dest.copy_from_slice(Sha3_256::digest(data).as_slice());
        dest
    }

    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn finish(&mut self) -> [u8; 32] {
        let mut dest = [0; 32];
        dest.copy_from_slice(self.hasher.finalize_reset().as_slice());
        dest
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digest_matches_incremental_hashing() {
        let data = b"payload bytes";

        let mut hasher = Sha3Hasher::default();
        hasher.update(&data[..7]);
        hasher.update(&data[7..]);

        assert_eq!(Sha3Hasher::digest(data), hasher.finish());
    }

    #[test]
    fn test_digest_buffers_equals_concatenated_digest() {
        let hash = Sha3Hasher::digest_buffers(&[b"pay", b"load"]);
        assert_eq!(HashType::new(Sha3Hasher::digest(b"payload")), hash);
    }
}
