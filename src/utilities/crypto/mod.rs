use std::fmt::{Debug, Display};

use thiserror::Error;

use crate::utilities::encoding::to_hex;

pub(crate) mod ed25519;

pub use ed25519::Keypair;

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Invalid hexadecimal")]
    InvalidHexadecimal,
    #[error("Invalid key length")]
    SliceLength,
    #[error("Invalid signature")]
    Signature,
    #[error("Invalid private key: '{}'", .0)]
    PrivateKey(String),
    #[error("Invalid public key")]
    PublicKey,
}

/// Identity of a process: the raw bytes of its Ed25519 verification key.
/// Identities are compared, ordered and hashed over these bytes, which keeps
/// view and certificate serialisation canonical.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) [u8; 32]);

impl ProcessId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex(self.0)
    }

    pub fn from_hex(hex: &str) -> Result<Self, KeyPairError> {
        let bytes = array_bytes::hex2bytes(hex).map_err(|_| KeyPairError::InvalidHexadecimal)?;
        let bytes = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyPairError::SliceLength)?;
        Ok(Self(bytes))
    }
}

// Identities log as a short hex prefix; the full value is only interesting
// on the wire.
impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}…", to_hex(&self.0[..4]))
    }
}

impl Debug for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}…", to_hex(&self.0[..4]))
    }
}

/// Detached Ed25519 signature.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub(crate) [u8; 64]);

impl Signature {
    pub fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}…", to_hex(&self.0[..8]))
    }
}
